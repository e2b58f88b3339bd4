//! Frontier detection for autonomous exploration.
//!
//! A frontier cell is a FREE cell with at least one 4-neighbour the grid
//! has never observed. Frontier cells are clustered with a 4-connected
//! flood fill; clusters carry their centroid and are returned largest
//! first. Driving toward frontiers expands the map until none remain.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::core::{GridCell, WorldPoint};
use crate::grid::FREE_THRESH;

/// A connected group of frontier cells.
#[derive(Debug, Clone)]
pub struct FrontierCluster {
    pub cells: Vec<GridCell>,
    pub centroid_ix: f32,
    pub centroid_iz: f32,
}

impl FrontierCluster {
    pub fn size(&self) -> usize {
        self.cells.len()
    }

    /// Centroid in world coordinates (cell centres).
    pub fn centroid_world(&self) -> WorldPoint {
        use crate::core::CELL_SIZE;
        WorldPoint::new(
            (self.centroid_ix + 0.5) * CELL_SIZE,
            (self.centroid_iz + 0.5) * CELL_SIZE,
        )
    }

    /// Cell nearest the centroid, used as a plan goal.
    pub fn centroid_cell(&self) -> GridCell {
        GridCell::new(
            self.centroid_ix.round() as i32,
            self.centroid_iz.round() as i32,
        )
    }
}

/// Find all frontier cells in a grid snapshot.
pub fn find_frontier_cells(cells: &HashMap<GridCell, f32>) -> Vec<GridCell> {
    let mut frontiers = Vec::new();
    for (&cell, &value) in cells {
        if value > FREE_THRESH {
            continue;
        }
        let touches_unknown = cell
            .neighbors_4()
            .iter()
            .any(|n| !cells.contains_key(n));
        if touches_unknown {
            frontiers.push(cell);
        }
    }
    frontiers
}

/// Cluster frontier cells with a 4-connected flood fill.
///
/// Returned clusters are sorted by size, largest first.
pub fn cluster_frontiers(frontier_cells: &[GridCell]) -> Vec<FrontierCluster> {
    let frontier_set: HashSet<GridCell> = frontier_cells.iter().copied().collect();
    let mut visited: HashSet<GridCell> = HashSet::new();
    let mut clusters = Vec::new();

    for &start in frontier_cells {
        if visited.contains(&start) {
            continue;
        }

        let mut cells = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(start);
        visited.insert(start);

        while let Some(current) = queue.pop_front() {
            cells.push(current);
            for neighbor in current.neighbors_4() {
                if frontier_set.contains(&neighbor) && visited.insert(neighbor) {
                    queue.push_back(neighbor);
                }
            }
        }

        let n = cells.len() as f32;
        let centroid_ix = cells.iter().map(|c| c.ix as f32).sum::<f32>() / n;
        let centroid_iz = cells.iter().map(|c| c.iz as f32).sum::<f32>() / n;
        clusters.push(FrontierCluster {
            cells,
            centroid_ix,
            centroid_iz,
        });
    }

    clusters.sort_by(|a, b| b.size().cmp(&a.size()));
    clusters
}

/// Detect and cluster in one pass.
pub fn find_frontiers(cells: &HashMap<GridCell, f32>) -> Vec<FrontierCluster> {
    cluster_frontiers(&find_frontier_cells(cells))
}

/// Order clusters by squared centroid distance from the robot, nearest
/// first. Target selection walks this order until a plan succeeds.
pub fn order_by_distance(clusters: &mut [FrontierCluster], robot: WorldPoint) {
    clusters.sort_by(|a, b| {
        let da = a.centroid_world().distance_sq(&robot);
        let db = b.centroid_world().distance_sq(&robot);
        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
    });
}
