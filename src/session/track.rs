use geo::{HaversineBearing, Point};

use super::row::LogRow;

/// Retained points must turn by more than this, degrees.
const BEARING_THRESHOLD: f64 = 3.0;
/// Raw points closer than this along the ride are duplicates, m.
const MIN_STEP: f64 = 1.0;

fn bearing(from: (f64, f64), to: (f64, f64)) -> f64 {
    Point::new(from.1, from.0).haversine_bearing(Point::new(to.1, to.0))
}

fn bearing_change(a: f64, b: f64) -> f64 {
    let d = (b - a).rem_euclid(360.0);
    d.min(360.0 - d)
}

/// Thin the logged positions into a polyline for redraws.
///
/// A point is kept when the ride has advanced at least `interval` metres and
/// the heading has turned since the last kept point. The first and last
/// positioned rows are always kept. Returns `(lat, lon)` pairs.
pub fn simplify_track(rows: &[LogRow], interval: f64) -> Vec<(f64, f64)> {
    let mut raw: Vec<((f64, f64), f64)> = Vec::new();
    for row in rows {
        let Some(pos) = row.position() else { continue };
        match raw.last() {
            Some(&(prev, dist)) if row.distance - dist < MIN_STEP || prev == pos => {}
            _ => raw.push((pos, row.distance)),
        }
    }

    let Some((&(first, first_dist), rest)) = raw.split_first() else {
        return Vec::new();
    };
    let mut out = vec![first];
    let mut kept_dist = first_dist;
    let mut kept_bearing: Option<f64> = None;
    for (i, &(pos, dist)) in rest.iter().enumerate() {
        let last_point = i + 1 == rest.len();
        let Some(&kept) = out.last() else { break };
        let b = bearing(kept, pos);
        let turned = kept_bearing.map_or(true, |kb| bearing_change(kb, b) > BEARING_THRESHOLD);
        if last_point || (dist - kept_dist >= interval && turned) {
            out.push(pos);
            kept_dist = dist;
            kept_bearing = Some(b);
        }
    }
    out
}
