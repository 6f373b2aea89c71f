pub mod envelope;
pub mod payload;
pub mod task;

pub use envelope::{Envelope, FinishedStatus, FinishedTask, QueuedTask, SignedTask};
pub use payload::{
    ItemListing, ListingRef, ListingUpdate, PayloadError, TaskPayload, VehicleListing,
};
pub use task::{DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY, Task, TaskType, generate_task_id};
