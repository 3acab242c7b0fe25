mod cancel;
mod health;
mod slow_query;
mod util;

pub use cancel::{DETACHED_COMPLETE_LINE, cancel_demo};
pub use health::health_check;
pub use slow_query::{COMPLETE_LINE, INTERIM_LINE, slow_query};
