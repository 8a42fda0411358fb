pub mod enums;
pub mod natural_key;
pub mod patient;
pub mod stage;

pub use enums::*;
pub use natural_key::*;
pub use patient::*;
pub use stage::*;
