use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Opaque world identifier, primary key in the worlds namespace.
pub type WorldToken = String;

/// Last reported state of one player inside a world.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PlayerState {
    pub position: [f32; 3],
    pub azimuth: f32,
    pub elevation: f32,
    pub velocity: [f32; 3],
}

/// A cube of voxels plus the players currently known to it.
///
/// Cells are stored flat, indexed by `x + y*S + z*S*S`. A value of 0 is air;
/// anything else is a material id only the renderer interprets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct World {
    pub token: WorldToken,
    pub size: u32,
    pub voxels: Vec<u8>,
    pub players: BTreeMap<String, PlayerState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WorldError {
    #[error("voxel index {index} outside grid of {len} cells")]
    OutOfRange { index: usize, len: usize },
    #[error("world holds {actual} voxels, expected {expected} for size {size}")]
    Shape {
        size: u32,
        expected: usize,
        actual: usize,
    },
}

impl World {
    /// An all-air world of edge `size`.
    pub fn empty(token: WorldToken, size: u32) -> Self {
        World {
            token,
            size,
            voxels: vec![0; Self::cell_count(size)],
            players: BTreeMap::new(),
        }
    }

    pub fn cell_count(size: u32) -> usize {
        let s = size as usize;
        s * s * s
    }

    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    /// Checks `voxels.len() == size³`. Records read back from storage go
    /// through this before a session will use them.
    pub fn check_shape(&self) -> Result<(), WorldError> {
        let expected = Self::cell_count(self.size);
        if self.voxels.len() != expected {
            return Err(WorldError::Shape {
                size: self.size,
                expected,
                actual: self.voxels.len(),
            });
        }
        Ok(())
    }

    /// Flat index for in-range coordinates.
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        let s = self.size as usize;
        x + y * s + z * s * s
    }

    /// Maps any signed coordinate onto the grid, wrapping at every face.
    pub fn wrap(&self, x: i64, y: i64, z: i64) -> (usize, usize, usize) {
        let s = self.size as i64;
        (
            x.rem_euclid(s) as usize,
            y.rem_euclid(s) as usize,
            z.rem_euclid(s) as usize,
        )
    }

    /// Inverse of [`World::index`].
    pub fn coords(&self, index: usize) -> (usize, usize, usize) {
        let s = self.size as usize;
        (index % s, (index / s) % s, index / (s * s))
    }

    pub fn get_voxel(&self, x: usize, y: usize, z: usize) -> Option<u8> {
        let s = self.size as usize;
        if x >= s || y >= s || z >= s {
            return None;
        }
        self.voxels.get(self.index(x, y, z)).copied()
    }

    pub fn set_voxel(&mut self, x: usize, y: usize, z: usize, value: u8) -> Result<(), WorldError> {
        let s = self.size as usize;
        if x >= s || y >= s || z >= s {
            return Err(WorldError::OutOfRange {
                index: x + y * s + z * s * s,
                len: self.voxels.len(),
            });
        }
        let index = self.index(x, y, z);
        self.set_voxel_index(index, value)
    }

    pub fn set_voxel_index(&mut self, index: usize, value: u8) -> Result<(), WorldError> {
        let len = self.voxels.len();
        match self.voxels.get_mut(index) {
            Some(cell) => {
                *cell = value;
                Ok(())
            }
            None => Err(WorldError::OutOfRange { index, len }),
        }
    }

    /// Inserts or replaces the state of `username`.
    pub fn upsert_player(&mut self, username: &str, state: PlayerState) {
        self.players.insert(username.to_string(), state);
    }
}
