//! Windowing metadata carried by elements and outputs
//!
//! Window assignment happens upstream. The evaluator never computes windows;
//! it forwards the window set, timestamp and pane attached by the function to
//! every routed output.

pub mod pane;
pub mod types;
pub mod value;

pub use pane::{PaneInfo, PaneTiming};
pub use types::{Window, WindowBounds};
pub use value::WindowedValue;
