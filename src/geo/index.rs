//! Uniform lat/lng grid over driver positions.
//!
//! Updates touch at most two buckets. Radius queries visit only the cells of
//! the bounding box around the query point, wrapping at the antimeridian, and
//! fall back to a scan of every position when that box would hold more cells
//! than there are drivers.

use std::collections::{BTreeSet, HashMap, HashSet};

use uuid::Uuid;

use crate::geo::{grid_cell, haversine_km, KM_PER_DEGREE_LAT};
use crate::models::driver::GeoPoint;

type Cell = (i32, i32);

#[derive(Debug, Clone)]
pub struct GeoIndex {
    cell_degrees: f64,
    cells: HashMap<Cell, HashSet<Uuid>>,
    positions: HashMap<Uuid, (GeoPoint, Cell)>,
}

impl GeoIndex {
    pub fn new(cell_degrees: f64) -> Self {
        Self {
            cell_degrees,
            cells: HashMap::new(),
            positions: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn contains(&self, driver_id: &Uuid) -> bool {
        self.positions.contains_key(driver_id)
    }

    pub fn position(&self, driver_id: &Uuid) -> Option<GeoPoint> {
        self.positions.get(driver_id).map(|(point, _)| *point)
    }

    /// Inserting an id that is already present moves it.
    pub fn insert(&mut self, driver_id: Uuid, location: GeoPoint) {
        let cell = grid_cell(&location, self.cell_degrees);
        if let Some((_, old_cell)) = self.positions.insert(driver_id, (location, cell)) {
            if old_cell != cell {
                self.detach(&driver_id, old_cell);
            }
        }
        self.cells.entry(cell).or_default().insert(driver_id);
    }

    /// Returns false when the driver is not indexed.
    pub fn update(&mut self, driver_id: Uuid, location: GeoPoint) -> bool {
        if !self.positions.contains_key(&driver_id) {
            return false;
        }
        self.insert(driver_id, location);
        true
    }

    pub fn remove(&mut self, driver_id: &Uuid) -> Option<GeoPoint> {
        let (point, cell) = self.positions.remove(driver_id)?;
        self.detach(driver_id, cell);
        Some(point)
    }

    pub fn query_nearby(&self, point: &GeoPoint, radius_km: f64, limit: usize) -> Vec<(Uuid, f64)> {
        self.query_nearby_where(point, radius_km, limit, |_| true)
    }

    /// Drivers within `radius_km` of `point` accepted by `keep`, nearest
    /// first (ties by id), at most `limit` of them. Distances are in km.
    pub fn query_nearby_where<F>(
        &self,
        point: &GeoPoint,
        radius_km: f64,
        limit: usize,
        keep: F,
    ) -> Vec<(Uuid, f64)>
    where
        F: Fn(&Uuid) -> bool,
    {
        if limit == 0 || radius_km < 0.0 || self.positions.is_empty() {
            return Vec::new();
        }

        let lat_span = radius_km / KM_PER_DEGREE_LAT;
        let cos_lat = point.lat.to_radians().cos().abs().max(1e-6);
        let lng_span = (radius_km / (KM_PER_DEGREE_LAT * cos_lat)).min(360.0);

        let row_of = |lat: f64| (lat / self.cell_degrees).floor() as i32;
        let (min_row, max_row) = (row_of(point.lat - lat_span), row_of(point.lat + lat_span));
        let col_ranges = self.column_ranges(point.lng, lng_span);
        let box_cols: i64 = col_ranges
            .iter()
            .map(|(lo, hi)| i64::from(*hi) - i64::from(*lo) + 1)
            .sum();
        let box_cells = (i64::from(max_row) - i64::from(min_row) + 1) * box_cols;

        let mut hits: Vec<(Uuid, f64)> = Vec::new();
        let mut consider = |id: &Uuid, location: &GeoPoint| {
            if !keep(id) {
                return;
            }
            let distance = haversine_km(point, location);
            if distance <= radius_km {
                hits.push((*id, distance));
            }
        };

        if box_cells as usize > self.positions.len() {
            for (id, (location, _)) in &self.positions {
                consider(id, location);
            }
        } else {
            let cols: BTreeSet<i32> = col_ranges.iter().flat_map(|(lo, hi)| *lo..=*hi).collect();
            for row in min_row..=max_row {
                for &col in &cols {
                    let Some(bucket) = self.cells.get(&(row, col)) else {
                        continue;
                    };
                    for id in bucket {
                        if let Some((location, _)) = self.positions.get(id) {
                            consider(id, location);
                        }
                    }
                }
            }
        }

        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(limit);
        hits
    }

    /// Column ranges covering `lng - span ..= lng + span`, split in two where
    /// the box crosses the antimeridian.
    fn column_ranges(&self, lng: f64, span: f64) -> Vec<(i32, i32)> {
        let col_of = |lng: f64| (lng / self.cell_degrees).floor() as i32;
        let (west, east) = (lng - span, lng + span);

        if east - west >= 360.0 {
            vec![(col_of(-180.0), col_of(180.0))]
        } else if west < -180.0 {
            vec![(col_of(west + 360.0), col_of(180.0)), (col_of(-180.0), col_of(east))]
        } else if east > 180.0 {
            vec![(col_of(west), col_of(180.0)), (col_of(-180.0), col_of(east - 360.0))]
        } else {
            vec![(col_of(west), col_of(east))]
        }
    }

    fn detach(&mut self, driver_id: &Uuid, cell: Cell) {
        if let Some(bucket) = self.cells.get_mut(&cell) {
            bucket.remove(driver_id);
            if bucket.is_empty() {
                self.cells.remove(&cell);
            }
        }
    }
}
