#![allow(clippy::too_many_arguments, clippy::needless_range_loop, clippy::float_cmp)]

// Server-side world: entity arena, area tree, move clipping, client movement

pub mod edict;
pub mod sv_world;
pub mod sv_user;
pub mod cmd_queue;

pub use cmd_queue::{MoveCommandQueue, MoveQueueSender, QueuedMove};
pub use edict::{Edict, EdictPool, Solid};
pub use sv_world::{CollisionModel, SvError, SvWorldContext};
