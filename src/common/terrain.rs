use std::f64::consts::TAU;

use noise::{NoiseFn, OpenSimplex};
use uuid::Uuid;

use super::constants::WorldConstants;
use super::world::World;

/// Height-field terrain for a wrapping world.
///
/// Each column's height comes from 4-D noise sampled on a torus: the x and z
/// axes are each mapped onto a circle (cos, sin), so walking off one face of
/// the grid lands on the matching column of the opposite face.
pub struct TerrainGenerator {
    size: u32,
    noise: OpenSimplex,
    seed: u32,
}

impl TerrainGenerator {
    pub fn new(size: u32, seed: u32) -> Self {
        TerrainGenerator {
            size,
            noise: OpenSimplex::new(seed),
            seed,
        }
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Terrain surface height for column (x, z). Any integer is accepted;
    /// columns S apart return the same height.
    pub fn column_height(&self, x: i64, z: i64) -> f64 {
        let size = self.size as f64;
        let scale = WorldConstants::NOISE_SCALE_PER_CELL * size;

        let x_angle = x as f64 / size * TAU;
        let z_angle = z as f64 / size * TAU;
        let xa = scale * x_angle.cos();
        let xb = scale * x_angle.sin();
        let za = scale * z_angle.cos();
        let zb = scale * z_angle.sin();

        self.noise.get([xa, xb, za, zb]) * WorldConstants::HEIGHT_SCALE + size / 2.0
    }

    /// Material for a cell at height `y` in a column of surface height `height`.
    pub fn material_at(y: usize, height: f64) -> u8 {
        let y = y as f64;
        if y < height - 1.0 {
            WorldConstants::STONE
        } else if y < height {
            WorldConstants::GRASS
        } else {
            WorldConstants::AIR
        }
    }

    /// Fills every cell of `world` from this generator's height field.
    pub fn fill(&self, world: &mut World) {
        let s = world.size as usize;
        for z in 0..s {
            for x in 0..s {
                let height = self.column_height(x as i64, z as i64);
                for y in 0..s {
                    let index = world.index(x, y, z);
                    world.voxels[index] = Self::material_at(y, height);
                }
            }
        }
    }
}

/// A fresh random token with 128 bits of entropy.
pub fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generates a new world of edge `size` with a fresh token and random seed.
pub fn generate(size: u32) -> World {
    generate_with_seed(size, rand::random::<u32>())
}

/// Same as [`generate`] with a caller-chosen noise seed.
pub fn generate_with_seed(size: u32, seed: u32) -> World {
    let mut world = World::empty(new_token(), size);
    TerrainGenerator::new(size, seed).fill(&mut world);
    world
}
