//! Pluggable gating strategies. A strategy receives the parent population's
//! events plus the gate parameters and returns one geometry/index pair per
//! declared child. Merge and subtract are engine operations, not
//! strategies; they never pass through this seam.

use crate::dataset::{EventId, EventTable};
use crate::error::GatingError;
use crate::geometry::{Geometry, Quadrant, Sign};
use crate::region;
use serde_json::Value;
use std::collections::BTreeMap;

pub type Parameters = BTreeMap<String, Value>;

#[derive(Debug, Clone)]
pub struct GateOutput {
    pub child: String,
    pub geometry: Geometry,
    pub index: Vec<EventId>,
}

#[derive(Debug, Clone, Default)]
pub struct StrategyResult {
    pub outputs: Vec<GateOutput>,
    pub warnings: Vec<String>,
}

pub trait GatingStrategy {
    /// Parameters the given method requires; `Err` for an unknown method.
    /// Checked at gate creation so a misconfigured gate is reported before
    /// any data is touched.
    fn required_parameters(&self, method: &str) -> Result<Vec<&'static str>, GatingError>;

    fn gate(
        &self,
        table: &EventTable,
        parent_index: &[EventId],
        method: &str,
        parameters: &Parameters,
        children: &[String],
    ) -> Result<StrategyResult, GatingError>;
}

/// Manual geometry gating: the caller supplies the shape, the strategy
/// evaluates membership per declared child.
#[derive(Debug, Default)]
pub struct StaticStrategy;

/// Data-driven threshold gating: thresholds are placed at quantiles of the
/// parent distribution instead of being given explicitly.
#[derive(Debug, Default)]
pub struct QuantileStrategy;

impl GatingStrategy for StaticStrategy {
    fn required_parameters(&self, method: &str) -> Result<Vec<&'static str>, GatingError> {
        Ok(match method {
            "threshold_1d" => vec!["x", "threshold", "definitions"],
            "threshold_2d" => vec!["x", "y", "threshold_x", "threshold_y", "definitions"],
            "rect" => vec!["x", "y", "x_min", "x_max", "y_min", "y_max", "definitions"],
            "ellipse" => vec!["x", "y", "center", "width", "height", "angle", "definitions"],
            "polygon" => vec!["x", "y", "x_values", "y_values"],
            other => {
                return Err(GatingError::validation(format!(
                    "'{other}' is not a valid method for the static strategy"
                )))
            }
        })
    }

    fn gate(
        &self,
        table: &EventTable,
        parent_index: &[EventId],
        method: &str,
        parameters: &Parameters,
        children: &[String],
    ) -> Result<StrategyResult, GatingError> {
        let x = get_string(parameters, "x")?;
        let transform_x = get_optional_string(parameters, "transform_x");
        let transform_y = get_optional_string(parameters, "transform_y");
        let mut result = StrategyResult::default();
        match method {
            "threshold_1d" => {
                let threshold = get_f64(parameters, "threshold")?;
                for child in children {
                    let geometry = Geometry::Threshold1D {
                        x: x.clone(),
                        transform_x: transform_x.clone(),
                        threshold,
                        definitions: signs_for(parameters, child)?,
                    };
                    push_output(&mut result, table, parent_index, child, geometry)?;
                }
            }
            "threshold_2d" => {
                let y = get_string(parameters, "y")?;
                let threshold_x = get_f64(parameters, "threshold_x")?;
                let threshold_y = get_f64(parameters, "threshold_y")?;
                for child in children {
                    let geometry = Geometry::Threshold2D {
                        x: x.clone(),
                        y: y.clone(),
                        transform_x: transform_x.clone(),
                        transform_y: transform_y.clone(),
                        threshold_x,
                        threshold_y,
                        definitions: quadrants_for(parameters, child)?,
                    };
                    push_output(&mut result, table, parent_index, child, geometry)?;
                }
            }
            "rect" => {
                let y = get_string(parameters, "y")?;
                for child in children {
                    let geometry = Geometry::Rect {
                        x: x.clone(),
                        y: y.clone(),
                        transform_x: transform_x.clone(),
                        transform_y: transform_y.clone(),
                        x_min: get_f64(parameters, "x_min")?,
                        x_max: get_f64(parameters, "x_max")?,
                        y_min: get_f64(parameters, "y_min")?,
                        y_max: get_f64(parameters, "y_max")?,
                        definition: single_sign_for(parameters, child)?,
                    };
                    push_output(&mut result, table, parent_index, child, geometry)?;
                }
            }
            "ellipse" => {
                let y = get_string(parameters, "y")?;
                let center = get_pair(parameters, "center")?;
                for child in children {
                    let geometry = Geometry::Ellipse {
                        x: x.clone(),
                        y: y.clone(),
                        transform_x: transform_x.clone(),
                        transform_y: transform_y.clone(),
                        center,
                        width: get_f64(parameters, "width")?,
                        height: get_f64(parameters, "height")?,
                        angle: get_f64(parameters, "angle")?,
                        definition: single_sign_for(parameters, child)?,
                    };
                    push_output(&mut result, table, parent_index, child, geometry)?;
                }
            }
            "polygon" => {
                let [child] = children else {
                    return Err(GatingError::validation(
                        "A polygon gate produces exactly one child population",
                    ));
                };
                let child = child.as_str();
                let geometry = Geometry::Polygon {
                    x: x.clone(),
                    y: get_string(parameters, "y")?,
                    transform_x,
                    transform_y,
                    x_values: get_f64_list(parameters, "x_values")?,
                    y_values: get_f64_list(parameters, "y_values")?,
                };
                push_output(&mut result, table, parent_index, child, geometry)?;
            }
            other => {
                return Err(GatingError::validation(format!(
                    "'{other}' is not a valid method for the static strategy"
                )))
            }
        }
        Ok(result)
    }
}

impl GatingStrategy for QuantileStrategy {
    fn required_parameters(&self, method: &str) -> Result<Vec<&'static str>, GatingError> {
        Ok(match method {
            "gate_1d" => vec!["x", "q", "definitions"],
            "gate_2d" => vec!["x", "y", "qx", "qy", "definitions"],
            other => {
                return Err(GatingError::validation(format!(
                    "'{other}' is not a valid method for the quantile strategy"
                )))
            }
        })
    }

    fn gate(
        &self,
        table: &EventTable,
        parent_index: &[EventId],
        method: &str,
        parameters: &Parameters,
        children: &[String],
    ) -> Result<StrategyResult, GatingError> {
        let x = get_string(parameters, "x")?;
        let transform_x = get_optional_string(parameters, "transform_x");
        let transform_y = get_optional_string(parameters, "transform_y");
        let mut result = StrategyResult::default();
        match method {
            "gate_1d" => {
                let q = get_quantile(parameters, "q")?;
                let threshold = quantile(&table.axis_values(&x, parent_index)?, q)?;
                for child in children {
                    let geometry = Geometry::Threshold1D {
                        x: x.clone(),
                        transform_x: transform_x.clone(),
                        threshold,
                        definitions: signs_for(parameters, child)?,
                    };
                    push_output(&mut result, table, parent_index, child, geometry)?;
                }
            }
            "gate_2d" => {
                let y = get_string(parameters, "y")?;
                let qx = get_quantile(parameters, "qx")?;
                let qy = get_quantile(parameters, "qy")?;
                let threshold_x = quantile(&table.axis_values(&x, parent_index)?, qx)?;
                let threshold_y = quantile(&table.axis_values(&y, parent_index)?, qy)?;
                for child in children {
                    let geometry = Geometry::Threshold2D {
                        x: x.clone(),
                        y: y.clone(),
                        transform_x: transform_x.clone(),
                        transform_y: transform_y.clone(),
                        threshold_x,
                        threshold_y,
                        definitions: quadrants_for(parameters, child)?,
                    };
                    push_output(&mut result, table, parent_index, child, geometry)?;
                }
            }
            other => {
                return Err(GatingError::validation(format!(
                    "'{other}' is not a valid method for the quantile strategy"
                )))
            }
        }
        Ok(result)
    }
}

fn push_output(
    result: &mut StrategyResult,
    table: &EventTable,
    parent_index: &[EventId],
    child: &str,
    geometry: Geometry,
) -> Result<(), GatingError> {
    let index = region::evaluate(&geometry, table, parent_index)?;
    if index.is_empty() {
        result
            .warnings
            .push(format!("No events captured for child population '{child}'"));
    }
    result.outputs.push(GateOutput {
        child: child.to_string(),
        geometry,
        index,
    });
    Ok(())
}

/// Linear-interpolation quantile of an unsorted sample.
fn quantile(values: &[f64], q: f64) -> Result<f64, GatingError> {
    if values.is_empty() {
        return Err(GatingError::validation(
            "Cannot take a quantile of an empty population",
        ));
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = q * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    if lower == upper {
        return Ok(sorted[lower]);
    }
    let weight = pos - lower as f64;
    Ok(sorted[lower] * (1.0 - weight) + sorted[upper] * weight)
}

fn get_value<'a>(parameters: &'a Parameters, key: &str) -> Result<&'a Value, GatingError> {
    parameters
        .get(key)
        .ok_or_else(|| GatingError::validation(format!("Missing required parameter '{key}'")))
}

fn get_string(parameters: &Parameters, key: &str) -> Result<String, GatingError> {
    get_value(parameters, key)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| GatingError::validation(format!("Parameter '{key}' must be a string")))
}

fn get_optional_string(parameters: &Parameters, key: &str) -> Option<String> {
    parameters
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn get_f64(parameters: &Parameters, key: &str) -> Result<f64, GatingError> {
    get_value(parameters, key)?
        .as_f64()
        .ok_or_else(|| GatingError::validation(format!("Parameter '{key}' must be a number")))
}

fn get_quantile(parameters: &Parameters, key: &str) -> Result<f64, GatingError> {
    let q = get_f64(parameters, key)?;
    if !(0.0..=1.0).contains(&q) {
        return Err(GatingError::validation(format!(
            "Parameter '{key}' must lie in [0, 1]"
        )));
    }
    Ok(q)
}

fn get_f64_list(parameters: &Parameters, key: &str) -> Result<Vec<f64>, GatingError> {
    get_value(parameters, key)?
        .as_array()
        .map(|values| values.iter().map(Value::as_f64).collect::<Option<Vec<_>>>())
        .flatten()
        .ok_or_else(|| {
            GatingError::validation(format!("Parameter '{key}' must be a list of numbers"))
        })
}

fn get_pair(parameters: &Parameters, key: &str) -> Result<[f64; 2], GatingError> {
    let list = get_f64_list(parameters, key)?;
    if list.len() != 2 {
        return Err(GatingError::validation(format!(
            "Parameter '{key}' must hold exactly two numbers"
        )));
    }
    Ok([list[0], list[1]])
}

fn child_definition<'a>(parameters: &'a Parameters, child: &str) -> Result<&'a Value, GatingError> {
    get_value(parameters, "definitions")?
        .as_object()
        .and_then(|map| map.get(child))
        .ok_or_else(|| {
            GatingError::validation(format!(
                "Parameter 'definitions' is missing an entry for child population '{child}'"
            ))
        })
}

/// Parse a child's sign definition; a list means the child spans several
/// definitions (as a merged population does).
fn signs_for(parameters: &Parameters, child: &str) -> Result<Vec<Sign>, GatingError> {
    let value = child_definition(parameters, child)?;
    serde_json::from_value(normalize_list(value)).map_err(|_| {
        GatingError::validation(format!(
            "Definition for child '{child}' must be \"+\" or \"-\""
        ))
    })
}

fn quadrants_for(parameters: &Parameters, child: &str) -> Result<Vec<Quadrant>, GatingError> {
    let value = child_definition(parameters, child)?;
    serde_json::from_value(normalize_list(value)).map_err(|_| {
        GatingError::validation(format!(
            "Definition for child '{child}' must be one or more of \"++\", \"--\", \"+-\", \"-+\""
        ))
    })
}

fn single_sign_for(parameters: &Parameters, child: &str) -> Result<Sign, GatingError> {
    let signs = signs_for(parameters, child)?;
    if signs.len() != 1 {
        return Err(GatingError::validation(format!(
            "Definition for child '{child}' must be a single \"+\" or \"-\""
        )));
    }
    Ok(signs[0])
}

fn normalize_list(value: &Value) -> Value {
    match value {
        Value::Array(_) => value.clone(),
        other => Value::Array(vec![other.clone()]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::table_from;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> Parameters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_static_threshold_splits_parent() {
        let table = table_from(
            &["CD4"],
            &[(1, &[0.0]), (2, &[1.0]), (3, &[2.0]), (4, &[3.0])],
        );
        let parameters = params(&[
            ("x", json!("CD4")),
            ("threshold", json!(1.5)),
            ("definitions", json!({"pos": "+", "neg": "-"})),
        ]);
        let result = StaticStrategy
            .gate(
                &table,
                table.ids(),
                "threshold_1d",
                &parameters,
                &["pos".to_string(), "neg".to_string()],
            )
            .unwrap();
        assert_eq!(result.outputs.len(), 2);
        assert_eq!(result.outputs[0].index, vec![3, 4]);
        assert_eq!(result.outputs[1].index, vec![1, 2]);
    }

    #[test]
    fn test_static_polygon_requires_single_child() {
        let table = table_from(&["CD4", "CD8"], &[(1, &[0.5, 0.5])]);
        let parameters = params(&[
            ("x", json!("CD4")),
            ("y", json!("CD8")),
            ("x_values", json!([0.0, 1.0, 1.0, 0.0])),
            ("y_values", json!([0.0, 0.0, 1.0, 1.0])),
        ]);
        let err = StaticStrategy
            .gate(
                &table,
                table.ids(),
                "polygon",
                &parameters,
                &["a".to_string(), "b".to_string()],
            )
            .unwrap_err();
        assert!(err.message.contains("exactly one child"));
    }

    #[test]
    fn test_empty_child_emits_warning() {
        let table = table_from(&["CD4"], &[(1, &[0.0])]);
        let parameters = params(&[
            ("x", json!("CD4")),
            ("threshold", json!(5.0)),
            ("definitions", json!({"pos": "+"})),
        ]);
        let result = StaticStrategy
            .gate(&table, table.ids(), "threshold_1d", &parameters, &["pos".to_string()])
            .unwrap();
        assert!(result.warnings.iter().any(|w| w.contains("'pos'")));
    }

    #[test]
    fn test_quantile_threshold_follows_distribution() {
        let rows: Vec<(u64, Vec<f64>)> = (0..11).map(|i| (i as u64, vec![i as f64])).collect();
        let row_refs: Vec<(u64, &[f64])> = rows.iter().map(|(i, v)| (*i, v.as_slice())).collect();
        let table = table_from(&["CD4"], &row_refs);
        let parameters = params(&[
            ("x", json!("CD4")),
            ("q", json!(0.5)),
            ("definitions", json!({"hi": "+", "lo": "-"})),
        ]);
        let result = QuantileStrategy
            .gate(
                &table,
                table.ids(),
                "gate_1d",
                &parameters,
                &["hi".to_string(), "lo".to_string()],
            )
            .unwrap();
        // Median of 0..=10 is 5; positive side is boundary inclusive.
        assert_eq!(result.outputs[0].index, vec![5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_required_parameters_rejects_unknown_method() {
        assert!(StaticStrategy.required_parameters("density").is_err());
        assert_eq!(
            QuantileStrategy.required_parameters("gate_1d").unwrap(),
            vec!["x", "q", "definitions"]
        );
    }
}
