// cml-sdk: Foundation layer for the CML runner.
// No dependencies on other workspace crates; provides process supervision,
// trace output and filesystem/string helpers used by everything above it.

pub mod build_constants;
pub mod io_util;
pub mod process_invoker;
pub mod string_util;
pub mod trace;
pub mod which_util;

pub use build_constants::{CmlPackage, Source};
pub use io_util::IOUtil;
pub use process_invoker::{
    ProcessCancelledError, ProcessEvent, ProcessExitCodeError, ProcessInvoker, ProcessStartInfo,
};
pub use string_util::StringUtil;
pub use trace::{CollectingTraceWriter, NullTraceWriter, TraceLevel, TraceWriter, TracingTraceWriter};
pub use which_util::WhichUtil;
