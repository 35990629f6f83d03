pub mod classification;
pub mod clock;
pub mod ecs;
pub mod error;
pub mod events;
pub mod runner;
pub mod scenario;
pub mod shunting;
pub mod sync;
pub mod systems;
pub mod tracks;
pub mod workshops;
