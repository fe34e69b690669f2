//! Access-sample ingestion: the shared sample ring and the classifier that
//! turns samples into hot/cold requests.

pub mod classifier;
pub mod ring;

pub use classifier::{Classification, Classifier};
pub use ring::{EventControl, EventKind, PerfEventFd, RingRecord, SampleRecord, SampleRing};
