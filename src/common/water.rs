use super::constants::WorldConstants;
use super::world::{World, WorldError};

/// Per-cell water levels living alongside a world's voxels.
///
/// Levels are in `[0, WATER_CAPACITY]`. Only air cells hold water; the grid
/// wraps in every direction, matching voxel indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct WaterField {
    size: u32,
    levels: Vec<f32>,
}

impl WaterField {
    pub fn new(size: u32) -> Self {
        let s = size as usize;
        WaterField {
            size,
            levels: vec![0.0; s * s * s],
        }
    }

    /// A dry field shaped like `world`.
    pub fn for_world(world: &World) -> Self {
        Self::new(world.size)
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn levels(&self) -> &[f32] {
        &self.levels
    }

    pub fn level(&self, index: usize) -> f32 {
        self.levels.get(index).copied().unwrap_or(0.0)
    }

    /// Total water mass, summed in f64.
    pub fn total(&self) -> f64 {
        self.levels.iter().map(|&l| l as f64).sum()
    }

    /// Pours up to `amount` into an air cell. Returns what fit.
    pub fn add_water(&mut self, voxels: &[u8], index: usize, amount: f32) -> f32 {
        if index >= self.levels.len() || is_solid(voxels, index) || amount <= 0.0 {
            return 0.0;
        }
        let room = (WorldConstants::WATER_CAPACITY - self.levels[index]).max(0.0);
        let added = amount.min(room);
        self.levels[index] += added;
        added
    }

    /// Number of cells holding any water.
    pub fn wet_cells(&self) -> usize {
        self.levels.iter().filter(|&&l| l > 0.0).count()
    }

    /// [`WaterField::add_water`] against a world, by flat cell index.
    pub fn pour(&mut self, world: &World, index: usize, amount: f32) -> Result<f32, WorldError> {
        self.check_matches(world)?;
        if index >= self.levels.len() {
            return Err(WorldError::OutOfRange {
                index,
                len: self.levels.len(),
            });
        }
        Ok(self.add_water(&world.voxels, index, amount))
    }

    /// [`WaterField::step`] against a world's current voxels.
    pub fn step_world(&self, world: &World, gravity: f32) -> Result<WaterField, WorldError> {
        self.check_matches(world)?;
        Ok(self.step(&world.voxels, gravity))
    }

    fn check_matches(&self, world: &World) -> Result<(), WorldError> {
        if world.size != self.size || world.len() != self.levels.len() {
            return Err(WorldError::Shape {
                size: world.size,
                expected: self.levels.len(),
                actual: world.len(),
            });
        }
        Ok(())
    }

    /// Advances the field by one tick and returns the new field.
    ///
    /// Water first falls into the cell below, then whatever is in each cell
    /// spreads to its four horizontal neighbours in proportion to how much
    /// lower they sit. Both phases read only the previous phase's output, so
    /// the result does not depend on iteration order.
    pub fn step(&self, voxels: &[u8], gravity: f32) -> WaterField {
        debug_assert_eq!(voxels.len(), self.levels.len());
        let fallen = self.fall(voxels, gravity);
        fallen.spread(voxels)
    }

    fn fall(&self, voxels: &[u8], gravity: f32) -> WaterField {
        let fall_rate = (WorldConstants::WATER_FALL_RATE * gravity).clamp(0.0, 1.0);
        let mut next = self.levels.clone();

        for (i, &level) in self.levels.iter().enumerate() {
            if level <= 0.0 || is_solid(voxels, i) {
                continue;
            }
            let below = self.neighbour(i, 0, -1, 0);
            if below == i || is_solid(voxels, below) {
                continue;
            }
            let spare = (WorldConstants::WATER_CAPACITY - self.levels[below]).max(0.0);
            let moved = (level * fall_rate).min(spare);
            next[i] -= moved;
            next[below] += moved;
        }

        WaterField {
            size: self.size,
            levels: next,
        }
    }

    fn spread(&self, voxels: &[u8]) -> WaterField {
        // At most four outflows of SPREAD_RATE * level each, so a cell never
        // gives away more than it holds and never fills past capacity.
        const SIDES: [(i64, i64); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];
        let mut next = self.levels.clone();

        for (i, &level) in self.levels.iter().enumerate() {
            if level <= 0.0 || is_solid(voxels, i) {
                continue;
            }
            for (dx, dz) in SIDES {
                let n = self.neighbour(i, dx, 0, dz);
                if n == i || is_solid(voxels, n) {
                    continue;
                }
                let deficit = level - self.levels[n];
                if deficit <= 0.0 {
                    continue;
                }
                let moved = deficit * WorldConstants::WATER_SPREAD_RATE;
                next[i] -= moved;
                next[n] += moved;
            }
        }

        WaterField {
            size: self.size,
            levels: next,
        }
    }

    fn neighbour(&self, index: usize, dx: i64, dy: i64, dz: i64) -> usize {
        let s = self.size as i64;
        let su = self.size as usize;
        let x = (index % su) as i64;
        let y = ((index / su) % su) as i64;
        let z = (index / (su * su)) as i64;
        let nx = (x + dx).rem_euclid(s) as usize;
        let ny = (y + dy).rem_euclid(s) as usize;
        let nz = (z + dz).rem_euclid(s) as usize;
        nx + ny * su + nz * su * su
    }
}

fn is_solid(voxels: &[u8], index: usize) -> bool {
    voxels.get(index).is_some_and(|&v| v != WorldConstants::AIR)
}
