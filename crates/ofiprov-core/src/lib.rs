#![warn(missing_docs)]

//! ofiprov core: a fabric provider layered over a lower RDMA transport.
//! Memory registration, completion queues, counters with triggered
//! operations, manual and automatic progress, and a fid-based host ABI.

pub mod abi;
pub mod arena;
pub mod av;
pub mod cntr;
pub mod config;
pub mod context;
pub mod cq;
pub mod domain;
pub mod endpoint;
pub mod error;
pub mod flags;
pub mod lock;
pub mod logging;
pub mod lower;
pub mod metrics;
pub mod mr;
pub mod progress;
pub mod sim;
pub mod trigger;
pub mod variant;
pub mod vlane;
pub mod wait;
pub mod xfer;

pub use config::{ProgressMode, ProviderConfig};
pub use domain::{Domain, DomainAttr};
pub use error::{ProviderError, ProviderResult};
pub use flags::OpFlags;
pub use lower::LowerTransport;
