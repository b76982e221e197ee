// Shared constants for client, server and offline play
pub struct WorldConstants;

impl WorldConstants {
    // World dimensions
    pub const DEFAULT_WORLD_SIZE: u32 = 64;
    pub const MAX_WORLD_SIZE: u32 = 256;

    // Terrain shaping
    pub const NOISE_SCALE_PER_CELL: f64 = 0.01;
    pub const HEIGHT_SCALE: f64 = 10.0;

    // Material ids understood by the renderer's atlas
    pub const AIR: u8 = 0;
    pub const GRASS: u8 = 1;
    pub const STONE: u8 = 5;

    // Water simulation
    pub const WATER_CAPACITY: f32 = 1.0;
    pub const WATER_FALL_RATE: f32 = 0.5;
    pub const WATER_SPREAD_RATE: f32 = 0.2;

    // Network constants
    pub const DEFAULT_SERVER_ADDRESS: &'static str = "127.0.0.1:8080";
    pub const DEFAULT_DATA_DIR: &'static str = "./data";
    pub const USERS_NAMESPACE: &'static str = "users";
    pub const WORLDS_NAMESPACE: &'static str = "worlds";
}
