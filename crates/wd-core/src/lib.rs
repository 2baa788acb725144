pub mod cursor;
pub mod events;

pub use cursor::{buffer_index, normalize, scroll, Cursor, ScrollAction};
pub use events::{merge_paths, ChangeEvent, ChangeOp};
