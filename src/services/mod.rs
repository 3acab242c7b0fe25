mod work;

pub use work::{parse_work_duration, simulate_work};
