//! The Grid/Cell Store - sparse live-cell map over a bounded plane.
//!
//! A dead cell is represented by *absence*: the live-cell set is exactly
//! the key set of the store. Neighbor access is pure coordinate arithmetic
//! over [`Bounds`], never references between cells, so cells can be born
//! and removed every generation without aliasing concerns.
//!
//! Keys are ordered row-major (`y`, then `x`). Every traversal that
//! consumes draws walks the store in this order.

use crate::draw::DrawSource;
use crate::fixed::Resource;
use crate::policy::{PolicyId, PolicyTable};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Largest supported side length.
pub const MAX_DIMENSION: u32 = 4096;

/// A grid coordinate. Ordered row-major: by `y`, then `x`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coord {
    pub x: u32,
    pub y: u32,
}

impl Coord {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl Ord for Coord {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.y, self.x).cmp(&(other.y, other.x))
    }
}

impl PartialOrd for Coord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Identifier of one cell's line of descent. Assigned once at birth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineageId(pub u64);

impl fmt::Display for LineageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// A live cell. Its position is the key it is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    /// Non-negative balance; reaching zero removes the cell
    pub resource: Resource,

    /// Strategy this cell follows (always resolves in the match's table)
    pub policy: PolicyId,

    /// Generations survived since birth
    pub age: u64,

    /// This cell's own lineage id
    pub lineage: LineageId,

    /// Lineage of the parent, `None` for founders
    pub parent: Option<LineageId>,

    /// Lineage of the founder at the root of this cell's parent chain
    pub founder: LineageId,
}

/// Explicit initial placement of one founder cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellPlacement {
    pub x: u32,
    pub y: u32,
    pub policy: PolicyId,
}

/// Errors that reject a match configuration before it starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GridError {
    #[error("Invalid grid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Cell at {coord} references unknown policy {policy}")]
    UnknownPolicy { coord: Coord, policy: PolicyId },

    #[error("Placement {coord} lies outside the grid")]
    OutOfBounds { coord: Coord },

    #[error("Placement {0} is occupied twice")]
    DuplicatePlacement(Coord),

    #[error("Placement density must lie in [0, 1], got {0}")]
    InvalidDensity(f64),

    #[error("Starting resource must be positive, got {0}")]
    NonPositiveStart(Resource),
}

// ============================================================================
// BOUNDS
// ============================================================================

/// Width and height of a grid; all neighbor arithmetic lives here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub width: u32,
    pub height: u32,
}

impl Bounds {
    /// Total number of coordinates.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Returns the coordinate if `(x, y)` lies inside the grid.
    pub fn coord(&self, x: i64, y: i64) -> Option<Coord> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return None;
        }
        Some(Coord::new(x as u32, y as u32))
    }

    pub fn contains(&self, coord: Coord) -> bool {
        coord.x < self.width && coord.y < self.height
    }

    /// Coordinates within Chebyshev distance `radius` of `center`,
    /// excluding the center itself, in row-major offset order.
    ///
    /// Because offsets are scanned `dy` then `dx` ascending, the result is
    /// also ascending in [`Coord`] order.
    pub fn neighborhood(&self, center: Coord, radius: u32) -> Vec<Coord> {
        let r = radius as i64;
        let mut out = Vec::with_capacity(((2 * r + 1) * (2 * r + 1)) as usize);
        for dy in -r..=r {
            for dx in -r..=r {
                if dx == 0 && dy == 0 {
                    continue;
                }
                if let Some(c) = self.coord(center.x as i64 + dx, center.y as i64 + dy) {
                    out.push(c);
                }
            }
        }
        out
    }

    /// The 8-cell Moore neighborhood.
    pub fn moore(&self, center: Coord) -> Vec<Coord> {
        self.neighborhood(center, 1)
    }
}

// ============================================================================
// GRID
// ============================================================================

/// Sparse store of live cells, generation counter, and the match's draw source.
#[derive(Debug, Clone)]
pub struct Grid {
    bounds: Bounds,

    /// Live cells keyed by coordinate
    pub(crate) cells: BTreeMap<Coord, Cell>,

    /// Completed update cycles
    generation: u64,

    /// The only source of randomness for this match
    pub(crate) draws: DrawSource,

    /// Next lineage id to hand out
    pub(crate) next_lineage: u64,
}

impl Grid {
    /// Creates an empty grid bound to a freshly seeded draw source.
    pub fn empty(width: u32, height: u32, seed: u32) -> Result<Self, GridError> {
        if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(GridError::InvalidDimensions { width, height });
        }

        Ok(Self {
            bounds: Bounds { width, height },
            cells: BTreeMap::new(),
            generation: 0,
            draws: DrawSource::new(seed),
            next_lineage: 0,
        })
    }

    /// Creates a grid from explicit founder placements.
    pub fn with_placements(
        width: u32,
        height: u32,
        seed: u32,
        policies: &PolicyTable,
        placements: &[CellPlacement],
        starting_resource: Resource,
    ) -> Result<Self, GridError> {
        let mut grid = Self::empty(width, height, seed)?;
        for p in placements {
            grid.insert_founder(Coord::new(p.x, p.y), p.policy, starting_resource, policies)?;
        }
        Ok(grid)
    }

    /// Creates a grid by density placement.
    ///
    /// Every coordinate, in row-major order, consumes one draw against
    /// `density`; an occupied coordinate consumes one more to choose its
    /// policy from the id-ordered table.
    pub fn with_density(
        width: u32,
        height: u32,
        seed: u32,
        policies: &PolicyTable,
        density: f64,
        starting_resource: Resource,
    ) -> Result<Self, GridError> {
        if !density.is_finite() || !(0.0..=1.0).contains(&density) {
            return Err(GridError::InvalidDensity(density));
        }

        let mut grid = Self::empty(width, height, seed)?;
        for y in 0..height {
            for x in 0..width {
                if grid.draws.uniform() >= density {
                    continue;
                }
                let index = grid.draws.index(policies.len());
                if let Some(policy) = policies.by_index(index) {
                    grid.insert_founder(Coord::new(x, y), policy.id, starting_resource, policies)?;
                }
            }
        }
        Ok(grid)
    }

    /// Places a founder cell, validating its policy reference.
    pub fn insert_founder(
        &mut self,
        coord: Coord,
        policy: PolicyId,
        resource: Resource,
        policies: &PolicyTable,
    ) -> Result<LineageId, GridError> {
        if !self.bounds.contains(coord) {
            return Err(GridError::OutOfBounds { coord });
        }
        if !policies.contains(policy) {
            return Err(GridError::UnknownPolicy { coord, policy });
        }
        if !resource.is_positive() {
            return Err(GridError::NonPositiveStart(resource));
        }
        if self.cells.contains_key(&coord) {
            return Err(GridError::DuplicatePlacement(coord));
        }

        let lineage = self.allocate_lineage();
        self.cells.insert(
            coord,
            Cell {
                resource,
                policy,
                age: 0,
                lineage,
                parent: None,
                founder: lineage,
            },
        );
        Ok(lineage)
    }

    pub(crate) fn allocate_lineage(&mut self) -> LineageId {
        let id = LineageId(self.next_lineage);
        self.next_lineage += 1;
        id
    }

    /// Replaces the live-cell set with the next generation's buffer.
    pub(crate) fn commit(&mut self, next: BTreeMap<Coord, Cell>) {
        self.cells = next;
        self.generation += 1;
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn width(&self) -> u32 {
        self.bounds.width
    }

    pub fn height(&self) -> u32 {
        self.bounds.height
    }

    /// Number of completed update cycles.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The live cell at `coord`, if any. Absence means empty/dead.
    pub fn get(&self, coord: Coord) -> Option<&Cell> {
        self.cells.get(&coord)
    }

    pub fn is_alive(&self, coord: Coord) -> bool {
        self.cells.contains_key(&coord)
    }

    /// Live cells in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (&Coord, &Cell)> {
        self.cells.iter()
    }

    pub fn alive_count(&self) -> usize {
        self.cells.len()
    }

    /// Sum of all live balances.
    pub fn total_resource(&self) -> Resource {
        self.cells.values().map(|c| c.resource).sum()
    }

    /// Per-policy balance totals.
    pub fn policy_totals(&self) -> BTreeMap<PolicyId, Resource> {
        let mut totals = BTreeMap::new();
        for cell in self.cells.values() {
            *totals.entry(cell.policy).or_insert(Resource::ZERO) += cell.resource;
        }
        totals
    }

    /// Draw source state (read-only; the engine threads it explicitly).
    pub fn draws(&self) -> &DrawSource {
        &self.draws
    }

    /// Adds `delta` to one cell's balance, bypassing the update rules.
    ///
    /// Fault injection for desync testing. Returns the new balance.
    pub fn perturb_resource(&mut self, coord: Coord, delta: Resource) -> Option<Resource> {
        let cell = self.cells.get_mut(&coord)?;
        cell.resource += delta;
        Some(cell.resource)
    }

    /// Canonical little-endian encoding of the generation and live-cell set.
    pub fn encode_cells(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24 + self.cells.len() * 53);
        buf.extend_from_slice(&self.generation.to_le_bytes());
        buf.extend_from_slice(&self.bounds.width.to_le_bytes());
        buf.extend_from_slice(&self.bounds.height.to_le_bytes());
        buf.extend_from_slice(&(self.cells.len() as u64).to_le_bytes());

        for (coord, cell) in &self.cells {
            buf.extend_from_slice(&coord.x.to_le_bytes());
            buf.extend_from_slice(&coord.y.to_le_bytes());
            buf.extend_from_slice(&cell.resource.raw().to_le_bytes());
            buf.extend_from_slice(&cell.policy.0.to_le_bytes());
            buf.extend_from_slice(&cell.age.to_le_bytes());
            buf.extend_from_slice(&cell.lineage.0.to_le_bytes());
            match cell.parent {
                Some(parent) => {
                    buf.push(1);
                    buf.extend_from_slice(&parent.0.to_le_bytes());
                }
                None => buf.push(0),
            }
            buf.extend_from_slice(&cell.founder.0.to_le_bytes());
        }
        buf
    }

    /// SHA-256 of [`Grid::encode_cells`].
    pub fn state_hash(&self) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(self.encode_cells());
        h.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyRecord;

    fn table() -> PolicyTable {
        PolicyTable::from_records(&[PolicyRecord::new(1, "a"), PolicyRecord::new(2, "b")]).unwrap()
    }

    #[test]
    fn test_coord_row_major_order() {
        let mut coords = vec![Coord::new(2, 0), Coord::new(0, 1), Coord::new(1, 0)];
        coords.sort();
        assert_eq!(coords, vec![Coord::new(1, 0), Coord::new(2, 0), Coord::new(0, 1)]);
    }

    #[test]
    fn test_neighborhood_scan_order_and_bounds() {
        let bounds = Bounds { width: 3, height: 3 };

        // Center has 8 neighbors, corner 3, edge 5
        assert_eq!(bounds.moore(Coord::new(1, 1)).len(), 8);
        assert_eq!(bounds.moore(Coord::new(0, 0)).len(), 3);
        assert_eq!(bounds.moore(Coord::new(1, 0)).len(), 5);

        let n = bounds.moore(Coord::new(1, 1));
        let mut sorted = n.clone();
        sorted.sort();
        assert_eq!(n, sorted);
        assert_eq!(n[0], Coord::new(0, 0));
        assert_eq!(n[7], Coord::new(2, 2));

        assert_eq!(bounds.neighborhood(Coord::new(1, 1), 0).len(), 0);
        assert_eq!(Bounds { width: 10, height: 10 }.neighborhood(Coord::new(5, 5), 2).len(), 24);
    }

    #[test]
    fn test_invalid_policy_reference_rejected() {
        let placements = vec![CellPlacement { x: 0, y: 0, policy: PolicyId(9) }];
        let err = Grid::with_placements(4, 4, 1, &table(), &placements, Resource::from_units(50))
            .unwrap_err();
        assert_eq!(
            err,
            GridError::UnknownPolicy { coord: Coord::new(0, 0), policy: PolicyId(9) }
        );
    }

    #[test]
    fn test_placement_errors() {
        let start = Resource::from_units(50);
        let outside = vec![CellPlacement { x: 4, y: 0, policy: PolicyId(1) }];
        assert!(matches!(
            Grid::with_placements(4, 4, 1, &table(), &outside, start),
            Err(GridError::OutOfBounds { .. })
        ));

        let twice = vec![
            CellPlacement { x: 1, y: 1, policy: PolicyId(1) },
            CellPlacement { x: 1, y: 1, policy: PolicyId(2) },
        ];
        assert_eq!(
            Grid::with_placements(4, 4, 1, &table(), &twice, start).unwrap_err(),
            GridError::DuplicatePlacement(Coord::new(1, 1))
        );

        assert!(matches!(Grid::empty(0, 5, 1), Err(GridError::InvalidDimensions { .. })));
        assert!(matches!(
            Grid::with_density(4, 4, 1, &table(), 1.5, start),
            Err(GridError::InvalidDensity(_))
        ));
    }

    #[test]
    fn test_founders_get_sequential_lineages() {
        let placements: Vec<_> = (0..3)
            .map(|x| CellPlacement { x, y: 0, policy: PolicyId(1) })
            .collect();
        let grid = Grid::with_placements(4, 4, 1, &table(), &placements, Resource::from_units(50))
            .unwrap();

        let lineages: Vec<_> = grid.iter().map(|(_, c)| c.lineage).collect();
        assert_eq!(lineages, vec![LineageId(0), LineageId(1), LineageId(2)]);
        assert!(grid.iter().all(|(_, c)| c.founder == c.lineage && c.parent.is_none()));
        assert_eq!(grid.total_resource(), Resource::from_units(150));
    }

    #[test]
    fn test_density_placement_is_deterministic() {
        let a = Grid::with_density(20, 20, 77, &table(), 0.3, Resource::from_units(50)).unwrap();
        let b = Grid::with_density(20, 20, 77, &table(), 0.3, Resource::from_units(50)).unwrap();
        let c = Grid::with_density(20, 20, 78, &table(), 0.3, Resource::from_units(50)).unwrap();

        assert_eq!(a.state_hash(), b.state_hash());
        assert_ne!(a.state_hash(), c.state_hash());
        assert!(a.alive_count() > 60 && a.alive_count() < 180);
        assert!(a.policy_totals().len() == 2);
    }

    #[test]
    fn test_perturbation_changes_hash() {
        let placements = vec![CellPlacement { x: 2, y: 2, policy: PolicyId(2) }];
        let mut grid = Grid::with_placements(4, 4, 5, &table(), &placements, Resource::from_units(10))
            .unwrap();
        let before = grid.state_hash();

        let after = grid.perturb_resource(Coord::new(2, 2), Resource::UNIT);
        assert_eq!(after, Some(Resource::from_raw(1001)));
        assert_ne!(grid.state_hash(), before);
        assert_eq!(grid.perturb_resource(Coord::new(0, 0), Resource::UNIT), None);
    }
}
