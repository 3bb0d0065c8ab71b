mod errors;
mod coarse_clock;
mod version;

pub use self::errors::{Error, ErrorKind, ErrorType, QueryError, Result};
pub use self::coarse_clock::{coarse_monotonic_now, coarse_monotonic_clock_updater};
pub use self::version::Version;
