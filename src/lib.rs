//! Treepush Library
//!
//! Incremental file synchronization into a remote container filesystem.
//! Only what changed since the last push is sent, tracked by a persisted
//! size+mtime index; the wire is a tar stream plus a NUL-delimited remove
//! list driven through a caller-supplied command execution primitive.

pub mod fileset;
pub mod index;
pub mod logger;
pub mod pipe;
pub mod pusher;
pub mod remote;

pub use fileset::FileSet;
pub use index::{FileSnapshot, Index};
pub use logger::{NoopLogger, SyncLogger, TextLogger};
pub use pusher::{Action, CancelHandle, Cancelled, Pusher};
pub use remote::{Execute, Remote};
