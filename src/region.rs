//! Region-membership evaluation: a geometry plus a parent event subset in,
//! a child event index out. Pure functions, no tree or registry knowledge.

use crate::dataset::{EventId, EventTable};
use crate::error::GatingError;
use crate::geometry::{Geometry, Quadrant, Sign};

/// Evaluate `geometry` against the parent subset of `table`, returning the
/// member events in parent order.
pub fn evaluate(
    geometry: &Geometry,
    table: &EventTable,
    parent_index: &[EventId],
) -> Result<Vec<EventId>, GatingError> {
    geometry.validate()?;
    match geometry {
        Geometry::Threshold1D {
            x,
            threshold,
            definitions,
            ..
        } => {
            let values = table.axis_values(x, parent_index)?;
            let positive = definitions.contains(&Sign::Positive);
            let negative = definitions.contains(&Sign::Negative);
            Ok(parent_index
                .iter()
                .zip(values)
                .filter(|(_, v)| (positive && *v >= *threshold) || (negative && *v < *threshold))
                .map(|(id, _)| *id)
                .collect())
        }
        Geometry::Threshold2D {
            x,
            y,
            threshold_x,
            threshold_y,
            definitions,
            ..
        } => {
            let xs = table.axis_values(x, parent_index)?;
            let ys = table.axis_values(y, parent_index)?;
            let tx = round2(*threshold_x);
            let ty = round2(*threshold_y);
            let mut out = Vec::new();
            for (i, id) in parent_index.iter().enumerate() {
                let vx = round2(xs[i]);
                let vy = round2(ys[i]);
                let hit = definitions.iter().any(|q| match q {
                    Quadrant::PlusPlus => vx > tx && vy > ty,
                    Quadrant::MinusMinus => vx < tx && vy < ty,
                    Quadrant::PlusMinus => vx > tx && vy < ty,
                    Quadrant::MinusPlus => vx < tx && vy > ty,
                });
                if hit {
                    out.push(*id);
                }
            }
            Ok(out)
        }
        Geometry::Rect {
            x,
            y,
            x_min,
            x_max,
            y_min,
            y_max,
            definition,
            ..
        } => {
            let xs = table.axis_values(x, parent_index)?;
            let ys = table.axis_values(y, parent_index)?;
            Ok(signed(parent_index, definition, |i| {
                xs[i] >= *x_min && xs[i] <= *x_max && ys[i] >= *y_min && ys[i] <= *y_max
            }))
        }
        Geometry::Ellipse {
            x,
            y,
            center,
            width,
            height,
            angle,
            definition,
            ..
        } => {
            let xs = table.axis_values(x, parent_index)?;
            let ys = table.axis_values(y, parent_index)?;
            Ok(signed(parent_index, definition, |i| {
                inside_ellipse(xs[i], ys[i], *center, *width, *height, *angle)
            }))
        }
        Geometry::Polygon {
            x,
            y,
            x_values,
            y_values,
            ..
        } => {
            let xs = table.axis_values(x, parent_index)?;
            let ys = table.axis_values(y, parent_index)?;
            Ok(parent_index
                .iter()
                .enumerate()
                .filter(|(i, _)| point_in_polygon(xs[*i], ys[*i], x_values, y_values))
                .map(|(_, id)| *id)
                .collect())
        }
        Geometry::Subtracted { .. } => Err(GatingError::geometry(
            "Subtraction geometry has no shape and cannot be re-evaluated",
        )),
        Geometry::Supervised { .. } => Err(GatingError::geometry(
            "Supervised geometry has no shape and cannot be re-evaluated",
        )),
    }
}

fn signed<F: Fn(usize) -> bool>(parent_index: &[EventId], sign: &Sign, inside: F) -> Vec<EventId> {
    let keep_inside = *sign == Sign::Positive;
    parent_index
        .iter()
        .enumerate()
        .filter(|(i, _)| inside(*i) == keep_inside)
        .map(|(_, id)| *id)
        .collect()
}

/// Round to 2 decimal places; threshold comparisons apply this to both data
/// and thresholds to keep events from flapping across the boundary.
fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Point in rotated ellipse, boundary inclusive. `width`/`height` are full
/// extents, `angle` anticlockwise degrees.
pub(crate) fn inside_ellipse(
    px: f64,
    py: f64,
    center: [f64; 2],
    width: f64,
    height: f64,
    angle: f64,
) -> bool {
    let theta = angle.to_radians();
    let (sin, cos) = theta.sin_cos();
    let dx = px - center[0];
    let dy = py - center[1];
    let xr = dx * cos + dy * sin;
    let yr = -dx * sin + dy * cos;
    let a = width / 2.0;
    let b = height / 2.0;
    (xr * xr) / (a * a) + (yr * yr) / (b * b) <= 1.0
}

/// Even-odd point-in-polygon test; vertex order taken as given.
pub(crate) fn point_in_polygon(px: f64, py: f64, xs: &[f64], ys: &[f64]) -> bool {
    let n = xs.len();
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        if (ys[i] > py) != (ys[j] > py)
            && px < (xs[j] - xs[i]) * (py - ys[i]) / (ys[j] - ys[i]) + xs[i]
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> EventTable {
        let mut t = EventTable::new(vec!["CD4".to_string(), "CD8".to_string()]).unwrap();
        for (id, x, y) in [
            (1, 0.0, 0.0),
            (2, 1.0, 1.0),
            (3, 2.0, 2.0),
            (4, 3.0, 3.0),
            (5, 4.0, -1.0),
        ] {
            t.push_row(id, vec![x, y]).unwrap();
        }
        t
    }

    fn ids(t: &EventTable) -> Vec<EventId> {
        t.ids().to_vec()
    }

    #[test]
    fn test_threshold_1d_is_boundary_inclusive_for_positive() {
        let t = table();
        let geom = Geometry::Threshold1D {
            x: "CD4".to_string(),
            transform_x: None,
            threshold: 2.0,
            definitions: vec![Sign::Positive],
        };
        assert_eq!(evaluate(&geom, &t, &ids(&t)).unwrap(), vec![3, 4, 5]);
        let (gx, gtransform_x, gthreshold) = match &geom {
            Geometry::Threshold1D {
                x,
                transform_x,
                threshold,
                ..
            } => (x.clone(), transform_x.clone(), *threshold),
            _ => unreachable!(),
        };
        let neg = Geometry::Threshold1D {
            x: gx.clone(),
            transform_x: gtransform_x.clone(),
            threshold: gthreshold,
            definitions: vec![Sign::Negative],
        };
        assert_eq!(evaluate(&neg, &t, &ids(&t)).unwrap(), vec![1, 2]);
        // Merged definition covers the whole parent.
        let both = Geometry::Threshold1D {
            x: gx,
            transform_x: gtransform_x,
            threshold: gthreshold,
            definitions: vec![Sign::Positive, Sign::Negative],
        };
        assert_eq!(evaluate(&both, &t, &ids(&t)).unwrap(), ids(&t));
    }

    #[test]
    fn test_threshold_1d_is_idempotent() {
        let t = table();
        let geom = Geometry::Threshold1D {
            x: "CD8".to_string(),
            transform_x: None,
            threshold: 0.5,
            definitions: vec![Sign::Positive],
        };
        let first = evaluate(&geom, &t, &ids(&t)).unwrap();
        let second = evaluate(&geom, &t, &ids(&t)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_threshold_2d_rounds_before_strict_comparison() {
        let mut t = EventTable::new(vec!["CD4".to_string(), "CD8".to_string()]).unwrap();
        t.push_row(1, vec![1.004, 5.0]).unwrap(); // rounds onto the threshold
        t.push_row(2, vec![1.006, 5.0]).unwrap(); // rounds above it
        let geom = Geometry::Threshold2D {
            x: "CD4".to_string(),
            y: "CD8".to_string(),
            transform_x: None,
            transform_y: None,
            threshold_x: 1.0,
            threshold_y: 0.0,
            definitions: vec![Quadrant::PlusPlus],
        };
        assert_eq!(evaluate(&geom, &t, &[1, 2]).unwrap(), vec![2]);
    }

    #[test]
    fn test_rect_inclusive_bounds_and_complement() {
        let t = table();
        let geom = crate::geometry::tests::rect(0.0, 2.0, 0.0, 2.0, Sign::Positive);
        assert_eq!(evaluate(&geom, &t, &ids(&t)).unwrap(), vec![1, 2, 3]);
        let neg = crate::geometry::tests::rect(0.0, 2.0, 0.0, 2.0, Sign::Negative);
        assert_eq!(evaluate(&neg, &t, &ids(&t)).unwrap(), vec![4, 5]);
    }

    #[test]
    fn test_ellipse_rotation() {
        // A thin ellipse along the diagonal: after 45 degree rotation the
        // point (1,1) lies on the long axis, (1,-1) does not.
        assert!(inside_ellipse(1.0, 1.0, [0.0, 0.0], 4.0, 0.5, 45.0));
        assert!(!inside_ellipse(1.0, -1.0, [0.0, 0.0], 4.0, 0.5, 45.0));
    }

    #[test]
    fn test_polygon_even_odd() {
        let t = table();
        let geom = Geometry::Polygon {
            x: "CD4".to_string(),
            y: "CD8".to_string(),
            transform_x: None,
            transform_y: None,
            x_values: vec![-0.5, 2.5, 2.5, -0.5],
            y_values: vec![-0.5, -0.5, 2.5, 2.5],
        };
        assert_eq!(evaluate(&geom, &t, &ids(&t)).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_marker_geometries_cannot_be_evaluated() {
        let t = table();
        let sub = Geometry::Subtracted {
            x: "CD4".to_string(),
            y: Some("CD8".to_string()),
        };
        assert!(evaluate(&sub, &t, &ids(&t)).is_err());
    }
}
