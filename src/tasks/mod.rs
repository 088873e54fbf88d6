pub mod dispatcher;

pub use dispatcher::{DispatcherStatistics, ProcessedData, TaskDispatcher};
