//! Sparse 3D storage for the voxel and link grids
//!
//! [`Array3D`] keeps a dense window of values addressed by [`Index3D`] and
//! hands back a default for anything outside it. The window grows by doubling
//! the exceeded dimension and only shrinks on an explicit
//! [`Array3D::shrink_to_fit`], so steady-state lookups stay O(1).

use serde::{Deserialize, Serialize};
use std::ops::{Add, Sub};

/// Sentinel for an index that has not been set.
pub const INDEX_INVALID: i32 = -2147483647;

/// A three-integer lattice index (x, y, z).
///
/// Indices default to an invalid sentinel; use [`Index3D::is_valid`] before
/// trusting one that may not have been set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Index3D {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Index3D {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn invalid() -> Self {
        Self {
            x: INDEX_INVALID,
            y: INDEX_INVALID,
            z: INDEX_INVALID,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.x != INDEX_INVALID && self.y != INDEX_INVALID && self.z != INDEX_INVALID
    }
}

impl Default for Index3D {
    fn default() -> Self {
        Self::invalid()
    }
}

impl Add for Index3D {
    type Output = Index3D;
    fn add(self, rhs: Index3D) -> Index3D {
        Index3D::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Index3D {
    type Output = Index3D;
    fn sub(self, rhs: Index3D) -> Index3D {
        Index3D::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

/// A 3D array with a movable allocated window and a default value everywhere
/// else.
#[derive(Debug, Clone)]
pub struct Array3D<T> {
    default_value: T,
    data: Vec<T>,
    a_size: Index3D,
    a_off: Index3D,
    c_min: Index3D,
    c_max: Index3D,
}

impl<T: Clone + PartialEq> Array3D<T> {
    /// Creates an empty array returning `default_value` for every index.
    pub fn new(default_value: T) -> Self {
        Self {
            default_value,
            data: Vec::new(),
            a_size: Index3D::new(0, 0, 0),
            a_off: Index3D::new(0, 0, 0),
            c_min: Index3D::new(i32::MAX, i32::MAX, i32::MAX),
            c_max: Index3D::new(i32::MIN, i32::MIN, i32::MIN),
        }
    }

    /// Clears all data and frees the window.
    pub fn clear(&mut self) {
        self.data.clear();
        self.data.shrink_to_fit();
        self.a_size = Index3D::new(0, 0, 0);
        self.a_off = Index3D::new(0, 0, 0);
        self.c_min = Index3D::new(i32::MAX, i32::MAX, i32::MAX);
        self.c_max = Index3D::new(i32::MIN, i32::MIN, i32::MIN);
    }

    /// Minimum occupied index in each dimension.
    pub fn min_indices(&self) -> Index3D {
        self.c_min
    }

    /// Maximum occupied index in each dimension.
    pub fn max_indices(&self) -> Index3D {
        self.c_max
    }

    /// Currently allocated window size.
    pub fn window_size(&self) -> Index3D {
        self.a_size
    }

    /// Currently allocated window offset.
    pub fn window_offset(&self) -> Index3D {
        self.a_off
    }

    /// Value at `index`, or the default outside the window.
    pub fn at(&self, index: Index3D) -> &T {
        match self.linear_index(index) {
            Some(i) => &self.data[i],
            None => &self.default_value,
        }
    }

    /// Value at (x, y, z), or the default outside the window.
    pub fn get(&self, x: i32, y: i32, z: i32) -> &T {
        self.at(Index3D::new(x, y, z))
    }

    /// Reallocates the window to `new_size` at `new_offset`, keeping any
    /// overlapping values. Returns false if the allocation fails.
    pub fn resize(&mut self, new_size: Index3D, new_offset: Index3D) -> bool {
        if new_size == self.a_size && new_offset == self.a_off {
            return true;
        }
        let new_linear = new_size.x as i64 * new_size.y as i64 * new_size.z as i64;
        if new_linear <= 0 {
            self.clear();
            return true;
        }

        let mut new_data: Vec<T> = Vec::new();
        if new_data.try_reserve_exact(new_linear as usize).is_err() {
            return false;
        }
        new_data.resize(new_linear as usize, self.default_value.clone());

        // copy the overlapping region
        let old_min = self.a_off;
        let old_max = self.a_off + self.a_size;
        let new_min = new_offset;
        let new_max = new_offset + new_size;
        let min_overlap = Index3D::new(
            old_min.x.max(new_min.x),
            old_min.y.max(new_min.y),
            old_min.z.max(new_min.z),
        );
        let max_overlap = Index3D::new(
            old_max.x.min(new_max.x),
            old_max.y.min(new_max.y),
            old_max.z.min(new_max.z),
        );
        for k in min_overlap.z..max_overlap.z {
            for j in min_overlap.y..max_overlap.y {
                for i in min_overlap.x..max_overlap.x {
                    let old_i = self.linear_index_unchecked(i, j, k);
                    let new_i = ((i - new_offset.x)
                        + new_size.x * (j - new_offset.y)
                        + new_size.x * new_size.y * (k - new_offset.z))
                        as usize;
                    new_data[new_i] = self.data[old_i].clone();
                }
            }
        }

        self.data = new_data;
        self.a_size = new_size;
        self.a_off = new_offset;

        // clamp the occupied range to the new window
        if self.c_min.x < self.a_off.x {
            self.c_min.x = self.a_off.x;
        }
        if self.c_max.x > self.a_size.x + self.a_off.x {
            self.c_max.x = self.a_size.x + self.a_off.x;
        }
        if self.c_min.y < self.a_off.y {
            self.c_min.y = self.a_off.y;
        }
        if self.c_max.y > self.a_size.y + self.a_off.y {
            self.c_max.y = self.a_size.y + self.a_off.y;
        }
        if self.c_min.z < self.a_off.z {
            self.c_min.z = self.a_off.z;
        }
        if self.c_max.z > self.a_size.z + self.a_off.z {
            self.c_max.z = self.a_size.z + self.a_off.z;
        }
        true
    }

    /// Shrinks the window to the span of the occupied indices.
    pub fn shrink_to_fit(&mut self) -> bool {
        if self.c_max.x < self.c_min.x {
            self.clear();
            return true;
        }
        self.resize(self.c_max - self.c_min + Index3D::new(1, 1, 1), self.c_min)
    }

    /// Stores `value` at `index`, growing the window if necessary.
    ///
    /// Growth doubles the exceeded dimension on each attempt; if memory runs
    /// out it shrinks to fit and retries with smaller growth factors before
    /// reporting failure. Storing the default value is equivalent to
    /// [`Array3D::remove`].
    pub fn set(&mut self, index: Index3D, value: T) -> bool {
        if value == self.default_value {
            self.remove(index);
            return true;
        }

        match self.linear_index(index) {
            Some(i) => self.data[i] = value,
            None => {
                // reallocation required
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    let scale_divisor: i32 = match attempt {
                        1 => 1,
                        2 => {
                            if !self.shrink_to_fit() {
                                return false;
                            }
                            1
                        }
                        3 => 2,
                        4 => 4,
                        5 => 8,
                        _ => return false,
                    };

                    let mut new_min = self.a_off;
                    let mut new_max = self.a_off + self.a_size;
                    if new_min == new_max {
                        // no allocated space yet: seed +/- 2 around the index
                        new_min = index - Index3D::new(2, 2, 2);
                        new_max = index + Index3D::new(2, 2, 2);
                    } else {
                        while index.x <= new_min.x {
                            new_min.x -= (self.a_size.x / scale_divisor).max(1);
                        }
                        while index.x >= new_max.x {
                            new_max.x += (self.a_size.x / scale_divisor).max(1);
                        }
                        while index.y <= new_min.y {
                            new_min.y -= (self.a_size.y / scale_divisor).max(1);
                        }
                        while index.y >= new_max.y {
                            new_max.y += (self.a_size.y / scale_divisor).max(1);
                        }
                        while index.z <= new_min.z {
                            new_min.z -= (self.a_size.z / scale_divisor).max(1);
                        }
                        while index.z >= new_max.z {
                            new_max.z += (self.a_size.z / scale_divisor).max(1);
                        }
                    }

                    if self.resize(new_max - new_min, new_min) {
                        match self.linear_index(index) {
                            Some(i) => {
                                self.data[i] = value;
                                break;
                            }
                            None => return false,
                        }
                    }
                }
            }
        }

        if index.x < self.c_min.x {
            self.c_min.x = index.x;
        }
        if index.x > self.c_max.x {
            self.c_max.x = index.x;
        }
        if index.y < self.c_min.y {
            self.c_min.y = index.y;
        }
        if index.y > self.c_max.y {
            self.c_max.y = index.y;
        }
        if index.z < self.c_min.z {
            self.c_min.z = index.z;
        }
        if index.z > self.c_max.z {
            self.c_max.z = index.z;
        }
        true
    }

    /// Resets `index` to the default value. Never shrinks the window.
    pub fn remove(&mut self, index: Index3D) {
        let Some(i) = self.linear_index(index) else {
            return;
        };
        if self.data[i] == self.default_value {
            return;
        }
        self.data[i] = self.default_value.clone();
        self.update_min_max();
    }

    fn linear_index(&self, i: Index3D) -> Option<usize> {
        if i.x < self.a_off.x
            || i.x >= self.a_off.x + self.a_size.x
            || i.y < self.a_off.y
            || i.y >= self.a_off.y + self.a_size.y
            || i.z < self.a_off.z
            || i.z >= self.a_off.z + self.a_size.z
        {
            None
        } else {
            Some(self.linear_index_unchecked(i.x, i.y, i.z))
        }
    }

    fn linear_index_unchecked(&self, x: i32, y: i32, z: i32) -> usize {
        ((x - self.a_off.x)
            + self.a_size.x * (y - self.a_off.y)
            + self.a_size.x * self.a_size.y * (z - self.a_off.z)) as usize
    }

    fn update_min_max(&mut self) {
        self.c_min = Index3D::new(i32::MAX, i32::MAX, i32::MAX);
        self.c_max = Index3D::new(i32::MIN, i32::MIN, i32::MIN);
        for k in self.a_off.z..self.a_off.z + self.a_size.z {
            for j in self.a_off.y..self.a_off.y + self.a_size.y {
                for i in self.a_off.x..self.a_off.x + self.a_size.x {
                    if self.data[self.linear_index_unchecked(i, j, k)] != self.default_value {
                        if i < self.c_min.x {
                            self.c_min.x = i;
                        }
                        if i > self.c_max.x {
                            self.c_max.x = i;
                        }
                        if j < self.c_min.y {
                            self.c_min.y = j;
                        }
                        if j > self.c_max.y {
                            self.c_max.y = j;
                        }
                        if k < self.c_min.z {
                            self.c_min.z = k;
                        }
                        if k > self.c_max.z {
                            self.c_max.z = k;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_outside_window() {
        let arr: Array3D<i32> = Array3D::new(-1);
        assert_eq!(*arr.get(10, -4, 2), -1);
    }

    #[test]
    fn set_get_remove() {
        let mut arr = Array3D::new(0i32);
        assert!(arr.set(Index3D::new(1, 2, 3), 42));
        assert_eq!(*arr.get(1, 2, 3), 42);
        arr.remove(Index3D::new(1, 2, 3));
        assert_eq!(*arr.get(1, 2, 3), 0);
    }

    #[test]
    fn tracks_min_max_indices() {
        let mut arr = Array3D::new(0i32);
        arr.set(Index3D::new(-3, 0, 5), 1);
        arr.set(Index3D::new(4, -2, 7), 2);
        assert_eq!(arr.min_indices(), Index3D::new(-3, -2, 5));
        assert_eq!(arr.max_indices(), Index3D::new(4, 0, 7));
        arr.remove(Index3D::new(4, -2, 7));
        assert_eq!(arr.max_indices(), Index3D::new(-3, 0, 5));
    }

    #[test]
    fn grows_across_window_boundaries() {
        let mut arr = Array3D::new(0i32);
        for i in -10..10 {
            assert!(arr.set(Index3D::new(i, i * 2, -i), i as i32 + 100));
        }
        for i in -10..10 {
            assert_eq!(*arr.get(i, i * 2, -i), i as i32 + 100);
        }
    }

    #[test]
    fn shrink_to_fit_preserves_contents() {
        let mut arr = Array3D::new(0i32);
        arr.set(Index3D::new(0, 0, 0), 7);
        arr.set(Index3D::new(20, 20, 20), 9);
        arr.remove(Index3D::new(20, 20, 20));
        assert!(arr.shrink_to_fit());
        assert_eq!(*arr.get(0, 0, 0), 7);
        assert_eq!(arr.window_size(), Index3D::new(1, 1, 1));
    }

    #[test]
    fn setting_default_removes() {
        let mut arr = Array3D::new(0i32);
        arr.set(Index3D::new(2, 2, 2), 5);
        arr.set(Index3D::new(2, 2, 2), 0);
        assert_eq!(arr.min_indices(), Index3D::new(i32::MAX, i32::MAX, i32::MAX));
    }
}
