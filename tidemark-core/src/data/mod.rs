//! Vendor data: source adapter contract, session wrapper, normalizer

pub mod normalize;
pub mod provider;
pub mod replay;
pub mod session;

pub use normalize::{iter_quarters, parse_number, parse_timestamp, NormalizeSpec, Normalizer};
pub use provider::{RawRow, SourceAdapter, SourceError};
pub use replay::{daily_rows, StaticSource};
pub use session::{SessionClient, SessionRequest, SessionSource};
