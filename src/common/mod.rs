// Types shared between client, server and offline play
pub mod constants;
pub mod protocol;
pub mod terrain;
pub mod water;
pub mod world;
