use crate::error::GatingError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Which side of a 1D threshold (or rect/ellipse interior) a population
/// takes. `Negative` is the complement within the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sign {
    #[serde(rename = "+")]
    Positive,
    #[serde(rename = "-")]
    Negative,
}

impl fmt::Display for Sign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sign::Positive => write!(f, "+"),
            Sign::Negative => write!(f, "-"),
        }
    }
}

/// Quadrant of a 2D threshold gate, x sign then y sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quadrant {
    #[serde(rename = "++")]
    PlusPlus,
    #[serde(rename = "--")]
    MinusMinus,
    #[serde(rename = "+-")]
    PlusMinus,
    #[serde(rename = "-+")]
    MinusPlus,
}

impl fmt::Display for Quadrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quadrant::PlusPlus => write!(f, "++"),
            Quadrant::MinusMinus => write!(f, "--"),
            Quadrant::PlusMinus => write!(f, "+-"),
            Quadrant::MinusPlus => write!(f, "-+"),
        }
    }
}

/// Geometric definition of a gate. Threshold definitions are lists because
/// merging sibling threshold populations concatenates their signs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape")]
pub enum Geometry {
    #[serde(rename = "threshold")]
    Threshold1D {
        x: String,
        transform_x: Option<String>,
        threshold: f64,
        definitions: Vec<Sign>,
    },
    #[serde(rename = "2d_threshold")]
    Threshold2D {
        x: String,
        y: String,
        transform_x: Option<String>,
        transform_y: Option<String>,
        threshold_x: f64,
        threshold_y: f64,
        definitions: Vec<Quadrant>,
    },
    #[serde(rename = "rect")]
    Rect {
        x: String,
        y: String,
        transform_x: Option<String>,
        transform_y: Option<String>,
        x_min: f64,
        x_max: f64,
        y_min: f64,
        y_max: f64,
        definition: Sign,
    },
    #[serde(rename = "ellipse")]
    Ellipse {
        x: String,
        y: String,
        transform_x: Option<String>,
        transform_y: Option<String>,
        /// Full extent of each axis; the semi-axes are width/2 and height/2.
        center: [f64; 2],
        width: f64,
        height: f64,
        /// Rotation in degrees, anticlockwise.
        angle: f64,
        definition: Sign,
    },
    #[serde(rename = "poly")]
    Polygon {
        x: String,
        y: String,
        transform_x: Option<String>,
        transform_y: Option<String>,
        x_values: Vec<f64>,
        y_values: Vec<f64>,
    },
    /// Result of a subtraction; inherits the parent's axes, no shape of its
    /// own, cannot be re-evaluated.
    #[serde(rename = "sub")]
    Subtracted { x: String, y: Option<String> },
    /// Population produced by a supervised ML strategy; FMO projection
    /// needs an externally supplied axis profile.
    #[serde(rename = "sml")]
    Supervised { x: String, y: Option<String> },
}

impl Geometry {
    pub fn kind(&self) -> &'static str {
        match self {
            Geometry::Threshold1D { .. } => "threshold",
            Geometry::Threshold2D { .. } => "2d_threshold",
            Geometry::Rect { .. } => "rect",
            Geometry::Ellipse { .. } => "ellipse",
            Geometry::Polygon { .. } => "poly",
            Geometry::Subtracted { .. } => "sub",
            Geometry::Supervised { .. } => "sml",
        }
    }

    pub fn x_axis(&self) -> &str {
        match self {
            Geometry::Threshold1D { x, .. }
            | Geometry::Threshold2D { x, .. }
            | Geometry::Rect { x, .. }
            | Geometry::Ellipse { x, .. }
            | Geometry::Polygon { x, .. }
            | Geometry::Subtracted { x, .. }
            | Geometry::Supervised { x, .. } => x,
        }
    }

    pub fn y_axis(&self) -> Option<&str> {
        match self {
            Geometry::Threshold1D { .. } => None,
            Geometry::Threshold2D { y, .. }
            | Geometry::Rect { y, .. }
            | Geometry::Ellipse { y, .. }
            | Geometry::Polygon { y, .. } => Some(y),
            Geometry::Subtracted { y, .. } | Geometry::Supervised { y, .. } => y.as_deref(),
        }
    }

    pub fn transform_x(&self) -> Option<&str> {
        match self {
            Geometry::Threshold1D { transform_x, .. }
            | Geometry::Threshold2D { transform_x, .. }
            | Geometry::Rect { transform_x, .. }
            | Geometry::Ellipse { transform_x, .. }
            | Geometry::Polygon { transform_x, .. } => transform_x.as_deref(),
            Geometry::Subtracted { .. } | Geometry::Supervised { .. } => None,
        }
    }

    pub fn transform_y(&self) -> Option<&str> {
        match self {
            Geometry::Threshold2D { transform_y, .. }
            | Geometry::Rect { transform_y, .. }
            | Geometry::Ellipse { transform_y, .. }
            | Geometry::Polygon { transform_y, .. } => transform_y.as_deref(),
            _ => None,
        }
    }

    /// The sign definition as displayed, e.g. `"+"` or `"+,-"` after a merge.
    pub fn definition_string(&self) -> Option<String> {
        match self {
            Geometry::Threshold1D { definitions, .. } => Some(
                definitions
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            Geometry::Threshold2D { definitions, .. } => Some(
                definitions
                    .iter()
                    .map(|q| q.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            Geometry::Rect { definition, .. } | Geometry::Ellipse { definition, .. } => {
                Some(definition.to_string())
            }
            _ => None,
        }
    }

    /// Structural checks ahead of any index computation. Errors name the
    /// offending field.
    pub fn validate(&self) -> Result<(), GatingError> {
        match self {
            Geometry::Threshold1D {
                threshold,
                definitions,
                ..
            } => {
                if !threshold.is_finite() {
                    return Err(GatingError::geometry(
                        "Threshold geometry field 'threshold' must be finite",
                    ));
                }
                if definitions.is_empty() {
                    return Err(GatingError::geometry(
                        "Threshold geometry field 'definitions' must not be empty",
                    ));
                }
            }
            Geometry::Threshold2D {
                threshold_x,
                threshold_y,
                definitions,
                ..
            } => {
                if !threshold_x.is_finite() {
                    return Err(GatingError::geometry(
                        "2D threshold geometry field 'threshold_x' must be finite",
                    ));
                }
                if !threshold_y.is_finite() {
                    return Err(GatingError::geometry(
                        "2D threshold geometry field 'threshold_y' must be finite",
                    ));
                }
                if definitions.is_empty() {
                    return Err(GatingError::geometry(
                        "2D threshold geometry field 'definitions' must not be empty",
                    ));
                }
            }
            Geometry::Rect {
                x_min,
                x_max,
                y_min,
                y_max,
                ..
            } => {
                if x_min > x_max {
                    return Err(GatingError::geometry(
                        "Rect geometry field 'x_min' exceeds 'x_max'",
                    ));
                }
                if y_min > y_max {
                    return Err(GatingError::geometry(
                        "Rect geometry field 'y_min' exceeds 'y_max'",
                    ));
                }
            }
            Geometry::Ellipse { width, height, .. } => {
                if *width <= 0.0 {
                    return Err(GatingError::geometry(
                        "Ellipse geometry field 'width' must be positive",
                    ));
                }
                if *height <= 0.0 {
                    return Err(GatingError::geometry(
                        "Ellipse geometry field 'height' must be positive",
                    ));
                }
            }
            Geometry::Polygon {
                x_values, y_values, ..
            } => {
                if x_values.len() != y_values.len() {
                    return Err(GatingError::geometry(
                        "Polygon geometry fields 'x_values' and 'y_values' differ in length",
                    ));
                }
                if x_values.len() < 3 {
                    return Err(GatingError::geometry(
                        "Polygon geometry field 'x_values' needs at least 3 vertices",
                    ));
                }
            }
            Geometry::Subtracted { .. } | Geometry::Supervised { .. } => {}
        }
        Ok(())
    }

    /// Flatten to the key-value pairs used by snapshot records.
    pub fn to_kv(&self) -> Vec<(String, Value)> {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => vec![],
        }
    }

    /// Rebuild from snapshot key-value pairs. A missing required field is a
    /// `GeometryError` naming the field.
    pub fn from_kv(pairs: &[(String, Value)]) -> Result<Self, GatingError> {
        let mut map = serde_json::Map::new();
        for (key, value) in pairs {
            map.insert(key.clone(), value.clone());
        }
        let shape = map
            .get("shape")
            .and_then(Value::as_str)
            .ok_or_else(|| GatingError::geometry("Geometry is missing field 'shape'"))?
            .to_string();
        for field in Self::required_fields(&shape)? {
            if !map.contains_key(*field) {
                return Err(GatingError::geometry(format!(
                    "Geometry '{shape}' is missing field '{field}'"
                )));
            }
        }
        serde_json::from_value(Value::Object(map))
            .map_err(|e| GatingError::geometry(format!("Malformed '{shape}' geometry: {e}")))
    }

    fn required_fields(shape: &str) -> Result<&'static [&'static str], GatingError> {
        Ok(match shape {
            "threshold" => &["x", "threshold", "definitions"],
            "2d_threshold" => &["x", "y", "threshold_x", "threshold_y", "definitions"],
            "rect" => &["x", "y", "x_min", "x_max", "y_min", "y_max", "definition"],
            "ellipse" => &["x", "y", "center", "width", "height", "angle", "definition"],
            "poly" => &["x", "y", "x_values", "y_values"],
            "sub" | "sml" => &["x"],
            other => {
                return Err(GatingError::geometry(format!(
                    "Geometry shape '{other}' not recognised"
                )))
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn rect(x_min: f64, x_max: f64, y_min: f64, y_max: f64, sign: Sign) -> Geometry {
        Geometry::Rect {
            x: "CD4".to_string(),
            y: "CD8".to_string(),
            transform_x: None,
            transform_y: None,
            x_min,
            x_max,
            y_min,
            y_max,
            definition: sign,
        }
    }

    #[test]
    fn test_definition_string_joins_signs() {
        let geom = Geometry::Threshold1D {
            x: "CD4".to_string(),
            transform_x: None,
            threshold: 0.5,
            definitions: vec![Sign::Positive, Sign::Negative],
        };
        assert_eq!(geom.definition_string().unwrap(), "+,-");
    }

    #[test]
    fn test_kv_round_trip() {
        let geom = rect(0.0, 5.0, 0.0, 5.0, Sign::Positive);
        let kv = geom.to_kv();
        assert!(kv.iter().any(|(k, v)| k == "shape" && v == "rect"));
        assert_eq!(Geometry::from_kv(&kv).unwrap(), geom);
    }

    #[test]
    fn test_from_kv_names_missing_field() {
        let geom = rect(0.0, 5.0, 0.0, 5.0, Sign::Negative);
        let kv: Vec<(String, Value)> = geom
            .to_kv()
            .into_iter()
            .filter(|(k, _)| k != "y_max")
            .collect();
        let err = Geometry::from_kv(&kv).unwrap_err();
        assert!(err.message.contains("'y_max'"), "{}", err.message);
    }

    #[test]
    fn test_validate_rejects_degenerate_shapes() {
        assert!(rect(5.0, 0.0, 0.0, 5.0, Sign::Positive)
            .validate()
            .unwrap_err()
            .message
            .contains("x_min"));
        let poly = Geometry::Polygon {
            x: "CD4".to_string(),
            y: "CD8".to_string(),
            transform_x: None,
            transform_y: None,
            x_values: vec![0.0, 1.0],
            y_values: vec![0.0, 1.0],
        };
        assert!(poly.validate().is_err());
    }
}
