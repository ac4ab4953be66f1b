pub mod outcome;
pub mod progress;
pub mod request;

pub use outcome::*;
pub use progress::*;
pub use request::*;
