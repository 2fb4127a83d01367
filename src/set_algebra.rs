//! Merge and subtract across sibling populations. Merging concatenates
//! threshold definitions or re-expresses overlapping planar shapes as one
//! polygon; subtracting takes the set difference against the parent. The
//! results are free-standing population nodes; committing them to the tree
//! (and re-establishing the subset invariant) is the engine's job.

use crate::dataset::EventId;
use crate::error::GatingError;
use crate::geometry::Geometry;
use crate::population::Population;
use itertools::Itertools;
use std::collections::{BTreeMap, HashSet};

pub const MERGED_WARNING: &str = "MERGED POPULATION";
pub const CLUSTERS_VOID_WARNING: &str =
    "Associated clusters are now void. Repeat clustering on new population";

/// Number of boundary points used when an ellipse participates in a
/// planar union.
const ELLIPSE_BOUNDARY_POINTS: usize = 64;

pub fn default_merge_name(left: &str, right: &str) -> String {
    format!("merge_{left}_{right}")
}

/// Merge two sibling populations into a new, unattached population node.
pub fn merge_populations(
    left: &Population,
    right: &Population,
    new_name: Option<&str>,
) -> Result<Population, GatingError> {
    check_dimensions(left, right)?;
    if left.parent != right.parent {
        return Err(GatingError::consistency(format!(
            "Parent populations do not match: left parent is {:?}, right parent is {:?}",
            left.parent, right.parent
        )));
    }
    let name =
        new_name.map(str::to_string).unwrap_or_else(|| default_merge_name(&left.name, &right.name));
    let left_geom = required_geometry(left)?;
    let right_geom = required_geometry(right)?;
    let geometry = match (left_geom, right_geom) {
        (
            Geometry::Threshold1D {
                x,
                transform_x,
                threshold,
                definitions,
            },
            Geometry::Threshold1D {
                threshold: right_threshold,
                definitions: right_definitions,
                ..
            },
        ) => {
            if threshold != right_threshold {
                return Err(GatingError::consistency(
                    "Threshold merge assumes populations derived from the same gate; \
                     thresholds differ between left and right",
                ));
            }
            Geometry::Threshold1D {
                x: x.clone(),
                transform_x: transform_x.clone(),
                threshold: *threshold,
                definitions: definitions
                    .iter()
                    .chain(right_definitions.iter())
                    .copied()
                    .collect(),
            }
        }
        (
            Geometry::Threshold2D {
                x,
                y,
                transform_x,
                transform_y,
                threshold_x,
                threshold_y,
                definitions,
            },
            Geometry::Threshold2D {
                threshold_x: right_tx,
                threshold_y: right_ty,
                definitions: right_definitions,
                ..
            },
        ) => {
            if threshold_x != right_tx || threshold_y != right_ty {
                return Err(GatingError::consistency(
                    "Threshold merge assumes populations derived from the same gate; \
                     thresholds differ between left and right",
                ));
            }
            Geometry::Threshold2D {
                x: x.clone(),
                y: y.clone(),
                transform_x: transform_x.clone(),
                transform_y: transform_y.clone(),
                threshold_x: *threshold_x,
                threshold_y: *threshold_y,
                definitions: definitions
                    .iter()
                    .chain(right_definitions.iter())
                    .copied()
                    .collect(),
            }
        }
        (left_geom, right_geom) if is_planar(left_geom) && is_planar(right_geom) => {
            merge_shapes(left_geom, right_geom)?
        }
        (left_geom, right_geom) => {
            return Err(GatingError::consistency(format!(
                "Geometries must be of the same kind; left is '{}', right is '{}'",
                left_geom.kind(),
                right_geom.kind()
            )))
        }
    };

    let mut warnings: Vec<String> = left
        .warnings
        .iter()
        .chain(right.warnings.iter())
        .cloned()
        .collect();
    warnings.push(MERGED_WARNING.to_string());
    if !left.clusters.is_empty() || !right.clusters.is_empty() {
        warnings.push(CLUSTERS_VOID_WARNING.to_string());
    }

    Ok(Population {
        name,
        parent: left.parent.clone(),
        children: vec![],
        index: union_index(&left.index, &right.index),
        geometry: Some(geometry),
        prop_of_parent: 0.0,
        prop_of_total: 0.0,
        warnings,
        clusters: vec![],
        signature: merge_signatures(&left.signature, &right.signature),
    })
}

/// N-way merge, reducing pairwise left to right. Without an explicit name
/// the inputs must all share one population name.
pub fn merge_multiple_populations(
    populations: &[&Population],
    new_name: Option<&str>,
) -> Result<Population, GatingError> {
    if populations.len() < 2 {
        return Err(GatingError::validation(
            "Merging requires at least two populations",
        ));
    }
    if new_name.is_none() {
        let distinct: HashSet<&str> = populations.iter().map(|p| p.name.as_str()).collect();
        if distinct.len() != 1 {
            return Err(GatingError::validation(
                "If a new population name is not given the populations are expected \
                 to have the same population name",
            ));
        }
    }
    let mut merged = merge_populations(populations[0], populations[1], None)?;
    for population in &populations[2..] {
        merged = merge_populations(&merged, population, None)?;
    }
    merged.name = new_name
        .map(str::to_string)
        .unwrap_or_else(|| populations[0].name.clone());
    Ok(merged)
}

/// Subtract the union of `targets` from `parent`, producing an unattached
/// population carrying the `sub` marker geometry on the given axes.
pub fn subtract_populations(
    parent: &Population,
    targets: &[&Population],
    new_name: &str,
    x: String,
    y: Option<String>,
) -> Result<Population, GatingError> {
    if targets.is_empty() {
        return Err(GatingError::validation(
            "Subtraction requires at least one target population",
        ));
    }
    let removed: HashSet<EventId> = targets
        .iter()
        .flat_map(|t| t.index.iter().copied())
        .collect();
    let index: Vec<EventId> = parent
        .index
        .iter()
        .copied()
        .filter(|id| !removed.contains(id))
        .collect();
    Ok(Population {
        name: new_name.to_string(),
        parent: Some(parent.name.clone()),
        children: vec![],
        index,
        geometry: Some(Geometry::Subtracted { x, y }),
        prop_of_parent: 0.0,
        prop_of_total: 0.0,
        warnings: vec![],
        clusters: vec![],
        signature: BTreeMap::new(),
    })
}

fn required_geometry(population: &Population) -> Result<&Geometry, GatingError> {
    population.geometry.as_ref().ok_or_else(|| {
        GatingError::consistency(format!(
            "Population '{}' has no geometry and cannot be merged",
            population.name
        ))
    })
}

fn check_dimensions(left: &Population, right: &Population) -> Result<(), GatingError> {
    let lg = required_geometry(left)?;
    let rg = required_geometry(right)?;
    if lg.x_axis() != rg.x_axis() {
        return Err(GatingError::consistency(
            "X dimension differs between left and right populations",
        ));
    }
    if lg.y_axis() != rg.y_axis() {
        return Err(GatingError::consistency(
            "Y dimension differs between left and right populations",
        ));
    }
    if lg.transform_x() != rg.transform_x() {
        return Err(GatingError::consistency(
            "X dimension transform differs between left and right populations",
        ));
    }
    if lg.transform_y() != rg.transform_y() {
        return Err(GatingError::consistency(
            "Y dimension transform differs between left and right populations",
        ));
    }
    Ok(())
}

fn is_planar(geometry: &Geometry) -> bool {
    matches!(geometry, Geometry::Polygon { .. } | Geometry::Ellipse { .. })
}

/// Planar union of two overlapping shapes, re-expressed as the convex hull
/// of both boundaries.
fn merge_shapes(left: &Geometry, right: &Geometry) -> Result<Geometry, GatingError> {
    let left_boundary = boundary_points(left)?;
    let right_boundary = boundary_points(right)?;
    if !shapes_intersect(&left_boundary, &right_boundary) {
        return Err(GatingError::consistency(
            "Invalid: cannot merge non-overlapping populations",
        ));
    }
    let hull = convex_hull(
        left_boundary
            .iter()
            .chain(right_boundary.iter())
            .copied()
            .collect(),
    );
    let (x_values, y_values) = hull.into_iter().map(|p| (p[0], p[1])).unzip();
    Ok(Geometry::Polygon {
        x: left.x_axis().to_string(),
        y: left
            .y_axis()
            .map(str::to_string)
            .unwrap_or_default(),
        transform_x: left.transform_x().map(str::to_string),
        transform_y: left.transform_y().map(str::to_string),
        x_values,
        y_values,
    })
}

fn boundary_points(geometry: &Geometry) -> Result<Vec<[f64; 2]>, GatingError> {
    geometry.validate()?;
    match geometry {
        Geometry::Polygon {
            x_values, y_values, ..
        } => Ok(x_values
            .iter()
            .zip(y_values.iter())
            .map(|(x, y)| [*x, *y])
            .collect()),
        Geometry::Ellipse {
            center,
            width,
            height,
            angle,
            ..
        } => {
            let theta = angle.to_radians();
            let (sin, cos) = theta.sin_cos();
            let a = width / 2.0;
            let b = height / 2.0;
            Ok((0..ELLIPSE_BOUNDARY_POINTS)
                .map(|i| {
                    let t = 2.0 * std::f64::consts::PI * i as f64 / ELLIPSE_BOUNDARY_POINTS as f64;
                    let ex = a * t.cos();
                    let ey = b * t.sin();
                    [
                        center[0] + ex * cos - ey * sin,
                        center[1] + ex * sin + ey * cos,
                    ]
                })
                .collect())
        }
        other => Err(GatingError::consistency(format!(
            "Geometry '{}' has no planar boundary",
            other.kind()
        ))),
    }
}

fn shapes_intersect(a: &[[f64; 2]], b: &[[f64; 2]]) -> bool {
    let (ax, ay): (Vec<f64>, Vec<f64>) = a.iter().map(|p| (p[0], p[1])).unzip();
    let (bx, by): (Vec<f64>, Vec<f64>) = b.iter().map(|p| (p[0], p[1])).unzip();
    if a.iter()
        .any(|p| crate::region::point_in_polygon(p[0], p[1], &bx, &by))
        || b.iter()
            .any(|p| crate::region::point_in_polygon(p[0], p[1], &ax, &ay))
    {
        return true;
    }
    for i in 0..a.len() {
        let a1 = a[i];
        let a2 = a[(i + 1) % a.len()];
        for j in 0..b.len() {
            if segments_intersect(a1, a2, b[j], b[(j + 1) % b.len()]) {
                return true;
            }
        }
    }
    false
}

fn segments_intersect(p1: [f64; 2], p2: [f64; 2], q1: [f64; 2], q2: [f64; 2]) -> bool {
    let d1 = cross(q1, q2, p1);
    let d2 = cross(q1, q2, p2);
    let d3 = cross(p1, p2, q1);
    let d4 = cross(p1, p2, q2);
    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }
    (d1 == 0.0 && on_segment(q1, q2, p1))
        || (d2 == 0.0 && on_segment(q1, q2, p2))
        || (d3 == 0.0 && on_segment(p1, p2, q1))
        || (d4 == 0.0 && on_segment(p1, p2, q2))
}

fn cross(o: [f64; 2], a: [f64; 2], b: [f64; 2]) -> f64 {
    (a[0] - o[0]) * (b[1] - o[1]) - (a[1] - o[1]) * (b[0] - o[0])
}

fn on_segment(a: [f64; 2], b: [f64; 2], p: [f64; 2]) -> bool {
    p[0] >= a[0].min(b[0]) && p[0] <= a[0].max(b[0]) && p[1] >= a[1].min(b[1])
        && p[1] <= a[1].max(b[1])
}

/// Andrew's monotone chain; returns the hull anticlockwise without the
/// closing point.
fn convex_hull(mut points: Vec<[f64; 2]>) -> Vec<[f64; 2]> {
    points.sort_by(|a, b| a[0].total_cmp(&b[0]).then(a[1].total_cmp(&b[1])));
    points.dedup();
    if points.len() <= 2 {
        return points;
    }
    let mut lower: Vec<[f64; 2]> = vec![];
    for p in &points {
        while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], *p) <= 0.0 {
            lower.pop();
        }
        lower.push(*p);
    }
    let mut upper: Vec<[f64; 2]> = vec![];
    for p in points.iter().rev() {
        while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], *p) <= 0.0 {
            upper.pop();
        }
        upper.push(*p);
    }
    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

/// Union preserving ascending event order; duplicates counted once.
fn union_index(left: &[EventId], right: &[EventId]) -> Vec<EventId> {
    left.iter()
        .chain(right.iter())
        .copied()
        .unique()
        .sorted()
        .collect()
}

/// Mean of both signatures over the union of their channels.
fn merge_signatures(
    left: &BTreeMap<String, f64>,
    right: &BTreeMap<String, f64>,
) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    for key in left.keys().chain(right.keys()) {
        let merged = match (left.get(key), right.get(key)) {
            (Some(l), Some(r)) => (l + r) / 2.0,
            (Some(v), None) | (None, Some(v)) => *v,
            (None, None) => continue,
        };
        out.insert(key.clone(), merged);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Sign;
    use crate::population::Cluster;

    fn threshold_pop(name: &str, sign: Sign, threshold: f64, index: Vec<EventId>) -> Population {
        Population {
            name: name.to_string(),
            parent: Some("root".to_string()),
            children: vec![],
            index,
            geometry: Some(Geometry::Threshold1D {
                x: "CD4".to_string(),
                transform_x: Some("logicle".to_string()),
                threshold,
                definitions: vec![sign],
            }),
            prop_of_parent: 0.0,
            prop_of_total: 0.0,
            warnings: vec![],
            clusters: vec![],
            signature: BTreeMap::new(),
        }
    }

    fn polygon_pop(name: &str, xs: Vec<f64>, ys: Vec<f64>, index: Vec<EventId>) -> Population {
        Population {
            name: name.to_string(),
            parent: Some("root".to_string()),
            children: vec![],
            index,
            geometry: Some(Geometry::Polygon {
                x: "CD4".to_string(),
                y: "CD8".to_string(),
                transform_x: None,
                transform_y: None,
                x_values: xs,
                y_values: ys,
            }),
            prop_of_parent: 0.0,
            prop_of_total: 0.0,
            warnings: vec![],
            clusters: vec![],
            signature: BTreeMap::new(),
        }
    }

    #[test]
    fn test_threshold_merge_concatenates_definitions_and_unions_index() {
        let pos = threshold_pop("pos", Sign::Positive, 1.0, vec![3, 1, 5]);
        let neg = threshold_pop("neg", Sign::Negative, 1.0, vec![2, 3, 4]);
        let merged = merge_populations(&pos, &neg, Some("combined")).unwrap();
        assert_eq!(merged.name, "combined");
        assert_eq!(merged.index, vec![1, 2, 3, 4, 5]);
        assert_eq!(
            merged.geometry.as_ref().unwrap().definition_string().unwrap(),
            "+,-"
        );
        assert!(merged.warnings.iter().any(|w| w == MERGED_WARNING));
    }

    #[test]
    fn test_threshold_merge_rejects_mismatched_thresholds() {
        let pos = threshold_pop("pos", Sign::Positive, 1.0, vec![1]);
        let neg = threshold_pop("neg", Sign::Negative, 2.0, vec![2]);
        let err = merge_populations(&pos, &neg, None).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Consistency);
    }

    #[test]
    fn test_merge_rejects_mismatched_parents_and_axes() {
        let pos = threshold_pop("pos", Sign::Positive, 1.0, vec![1]);
        let mut other = threshold_pop("neg", Sign::Negative, 1.0, vec![2]);
        other.parent = Some("cd3".to_string());
        assert!(merge_populations(&pos, &other, None).is_err());

        let mut wrong_axis = threshold_pop("neg", Sign::Negative, 1.0, vec![2]);
        if let Some(Geometry::Threshold1D { x, .. }) = wrong_axis.geometry.as_mut() {
            *x = "CD8".to_string();
        }
        assert!(merge_populations(&pos, &wrong_axis, None).is_err());
    }

    #[test]
    fn test_polygon_merge_requires_overlap() {
        let a = polygon_pop(
            "a",
            vec![0.0, 2.0, 2.0, 0.0],
            vec![0.0, 0.0, 2.0, 2.0],
            vec![1, 2],
        );
        let b = polygon_pop(
            "b",
            vec![10.0, 12.0, 12.0, 10.0],
            vec![10.0, 10.0, 12.0, 12.0],
            vec![3],
        );
        let err = merge_populations(&a, &b, None).unwrap_err();
        assert!(err.message.contains("non-overlapping"));
    }

    #[test]
    fn test_polygon_merge_produces_covering_hull() {
        let a = polygon_pop(
            "a",
            vec![0.0, 2.0, 2.0, 0.0],
            vec![0.0, 0.0, 2.0, 2.0],
            vec![1, 2],
        );
        let b = polygon_pop(
            "b",
            vec![1.0, 3.0, 3.0, 1.0],
            vec![1.0, 1.0, 3.0, 3.0],
            vec![2, 3],
        );
        let merged = merge_populations(&a, &b, None).unwrap();
        assert_eq!(merged.name, "merge_a_b");
        assert_eq!(merged.index, vec![1, 2, 3]);
        let Some(Geometry::Polygon {
            x_values, y_values, ..
        }) = merged.geometry
        else {
            panic!("expected polygon geometry");
        };
        // Every source vertex sits inside or on the hull's bounding region.
        for (x, y) in [(0.0, 0.0), (2.0, 2.0), (3.0, 3.0), (1.0, 3.0)] {
            let inside = crate::region::point_in_polygon(x, y, &x_values, &y_values);
            let on_hull = x_values
                .iter()
                .zip(y_values.iter())
                .any(|(hx, hy)| *hx == x && *hy == y);
            assert!(inside || on_hull, "({x},{y}) escaped the union hull");
        }
    }

    #[test]
    fn test_merge_voids_clusters_with_warning() {
        let mut pos = threshold_pop("pos", Sign::Positive, 1.0, vec![1]);
        pos.clusters.push(Cluster {
            cluster_id: "c1".to_string(),
            tag: "flowsom".to_string(),
            n: 1,
        });
        let neg = threshold_pop("neg", Sign::Negative, 1.0, vec![2]);
        let merged = merge_populations(&pos, &neg, None).unwrap();
        assert!(merged.clusters.is_empty());
        assert!(merged.warnings.iter().any(|w| w == CLUSTERS_VOID_WARNING));
    }

    #[test]
    fn test_merge_averages_signatures() {
        let mut pos = threshold_pop("pos", Sign::Positive, 1.0, vec![1]);
        pos.signature.insert("CD4".to_string(), 2.0);
        pos.signature.insert("CD8".to_string(), 1.0);
        let mut neg = threshold_pop("neg", Sign::Negative, 1.0, vec![2]);
        neg.signature.insert("CD4".to_string(), 4.0);
        let merged = merge_populations(&pos, &neg, None).unwrap();
        assert_eq!(merged.signature.get("CD4"), Some(&3.0));
        // A channel present on one side only carries over unchanged.
        assert_eq!(merged.signature.get("CD8"), Some(&1.0));
    }

    #[test]
    fn test_multiple_merge_requires_shared_name_without_explicit_name() {
        let a = threshold_pop("pos", Sign::Positive, 1.0, vec![1]);
        let b = threshold_pop("neg", Sign::Negative, 1.0, vec![2]);
        assert!(merge_multiple_populations(&[&a, &b], None).is_err());
        let merged = merge_multiple_populations(&[&a, &b], Some("all")).unwrap();
        assert_eq!(merged.name, "all");
        assert_eq!(merged.index, vec![1, 2]);
    }

    #[test]
    fn test_subtraction_reconstructs_parent_with_merge_of_remainder() {
        let parent = threshold_pop("parent", Sign::Positive, 1.0, vec![1, 2, 3, 4, 5]);
        let target = threshold_pop("a", Sign::Positive, 1.0, vec![2, 4]);
        let rest = subtract_populations(&parent, &[&target], "rest", "CD4".to_string(), None)
            .unwrap();
        assert_eq!(rest.index, vec![1, 3, 5]);
        assert_eq!(rest.geometry.as_ref().unwrap().kind(), "sub");
        // rest ∪ target gives the parent index back.
        let recovered = union_index(&rest.index, &target.index);
        assert_eq!(recovered, parent.index);
    }
}
