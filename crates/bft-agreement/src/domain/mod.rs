//! Domain layer of the agreement engine
//!
//! Pure protocol state with no I/O:
//! - quorum, certificate, seq_log: vote counting and the sliding window
//! - messages, wire, request: the typed protocol vocabulary
//! - prepared_cert, big_req_table, replies, checkpoint: per-seqno and
//!   per-client bookkeeping used by normal-case operation
//! - old_requests, nv_info, view_info: the view-change coordinator
//! - client: reply certificates on the client side

mod big_req_table;
mod certificate;
mod checkpoint;
mod client;
mod messages;
mod nv_info;
mod old_requests;
mod prepared_cert;
mod quorum;
mod replies;
mod request;
mod seq_log;
mod timer;
mod view_info;
mod wire;

pub use big_req_table::*;
pub use certificate::*;
pub use checkpoint::*;
pub use client::*;
pub use messages::*;
pub use nv_info::*;
pub use old_requests::*;
pub use prepared_cert::*;
pub use quorum::*;
pub use replies::*;
pub use request::*;
pub use seq_log::*;
pub use timer::*;
pub use view_info::*;
pub use wire::*;
