pub mod clock;
pub mod file;
pub mod logger;
pub mod memory;
pub mod signal;
pub mod traits;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use file::{FileInput, FileOutput, OutputOpenMode};
pub use logger::{Loggers, RatesLog, ReadsLog};
pub use memory::{MemInput, MemOutput};
pub use signal::InterruptFlag;
pub use traits::{Input, Output, ReadChunk};
