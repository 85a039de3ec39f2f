use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use serde_json::{Map, Value};

/// When a `reportWhen` spec is present the trigger waits for the host's
/// report-ready signal instead of the visibility conditions.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ReportWhen {
    DocumentExit,
    DocumentHidden,
}

impl ReportWhen {
    fn parse(value: &Value) -> Result<Option<Self>> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) if s.is_empty() => Ok(None),
            Value::String(s) if s == "documentExit" => Ok(Some(ReportWhen::DocumentExit)),
            Value::String(s) if s == "documentHidden" => Ok(Some(ReportWhen::DocumentHidden)),
            other => Err(anyhow!("reportWhen value {other} not supported")),
        }
    }
}

/// Normalized visibility conditions for one trigger.
///
/// Percentages are stored as fractions in `[0, 1]`, times in milliseconds.
/// Unbounded maxima are `f64::INFINITY` (serialized as `null`).
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VisibilitySpec {
    /// Exclusive lower bound of a matching visibility ratio.
    pub visible_percentage_min: f64,
    /// Inclusive upper bound of a matching visibility ratio.
    pub visible_percentage_max: f64,

    /// Bounds on cumulative matching time.
    pub total_time_min: f64,
    pub total_time_max: f64,

    /// Bounds on the longest uninterrupted matching streak.
    pub continuous_time_min: f64,
    pub continuous_time_max: f64,

    /// Re-arm after firing once visibility leaves the matching range.
    pub repeat: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_when: Option<ReportWhen>,
}

impl Default for VisibilitySpec {
    fn default() -> Self {
        Self {
            visible_percentage_min: 0.0,
            visible_percentage_max: 1.0,
            total_time_min: 0.0,
            total_time_max: f64::INFINITY,
            continuous_time_min: 0.0,
            continuous_time_max: f64::INFINITY,
            repeat: false,
            report_when: None,
        }
    }
}

impl VisibilitySpec {
    /// Parses a JSON key/value spec. Numeric fields accept numbers or
    /// numeric strings; anything that coerces to 0 or NaN falls back to
    /// the field default, so an explicit 0 maximum means "unbounded".
    pub fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::Object(map) => Self::from_map(map),
            Value::Null => Ok(Self::default()),
            other => bail!("visibility spec must be an object, got {other}"),
        }
    }

    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let defaults = Self::default();
        let number = |key: &str| coerce_number(map.get(key));

        let repeat = matches!(map.get("repeat"), Some(Value::Bool(true)));
        let report_when = match map.get("reportWhen") {
            Some(value) => ReportWhen::parse(value)?,
            None => None,
        };
        if repeat && report_when.is_some() {
            bail!("reportWhen and repeat are mutually exclusive");
        }

        Ok(Self {
            visible_percentage_min: or_default(
                number("visiblePercentageMin") / 100.0,
                defaults.visible_percentage_min,
            ),
            visible_percentage_max: or_default(
                number("visiblePercentageMax") / 100.0,
                defaults.visible_percentage_max,
            ),
            total_time_min: or_default(number("totalTimeMin"), defaults.total_time_min),
            total_time_max: or_default(number("totalTimeMax"), defaults.total_time_max),
            continuous_time_min: or_default(
                number("continuousTimeMin"),
                defaults.continuous_time_min,
            ),
            continuous_time_max: or_default(
                number("continuousTimeMax"),
                defaults.continuous_time_max,
            ),
            repeat,
            report_when,
        })
    }

    /// Whether `visibility` falls in `(min, max]`. A 100% minimum only
    /// matches full visibility.
    pub fn matches(&self, visibility: f64) -> bool {
        if self.visible_percentage_min == 1.0 {
            return visibility == 1.0;
        }
        visibility > self.visible_percentage_min && visibility <= self.visible_percentage_max
    }
}

fn coerce_number(value: Option<&Value>) -> f64 {
    match value {
        None => f64::NAN,
        Some(Value::Null) => 0.0,
        Some(Value::Bool(flag)) => {
            if *flag {
                1.0
            } else {
                0.0
            }
        }
        Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
        Some(Value::String(s)) => parse_numeric_string(s.trim()),
        Some(_) => f64::NAN,
    }
}

/// Numeric string grammar of the page's number conversion: decimal with
/// optional exponent, `Infinity`, or an unsigned `0x`/`0o`/`0b` integer.
fn parse_numeric_string(s: &str) -> f64 {
    match s {
        "" => return 0.0,
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }

    let radix = match s.get(..2) {
        Some("0x" | "0X") => Some(16),
        Some("0o" | "0O") => Some(8),
        Some("0b" | "0B") => Some(2),
        _ => None,
    };
    if let Some(radix) = radix {
        let digits = &s[2..];
        if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
            return f64::NAN;
        }
        return u64::from_str_radix(digits, radix).map_or(f64::NAN, |n| n as f64);
    }

    // Rust also accepts "inf" and "nan" spellings; those are not numbers here.
    if s.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E') {
        return f64::NAN;
    }
    s.parse().unwrap_or(f64::NAN)
}

fn or_default(value: f64, default: f64) -> f64 {
    if value == 0.0 || value.is_nan() {
        default
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: Value) -> VisibilitySpec {
        VisibilitySpec::parse(&value).expect("spec should parse")
    }

    #[test]
    fn parses_visible_percentage_min() {
        assert_eq!(config(json!({})).visible_percentage_min, 0.0);
        assert_eq!(config(json!({"visiblePercentageMin": ""})).visible_percentage_min, 0.0);
        assert_eq!(config(json!({"visiblePercentageMin": 0})).visible_percentage_min, 0.0);
        assert_eq!(config(json!({"visiblePercentageMin": "0"})).visible_percentage_min, 0.0);
        assert_eq!(config(json!({"visiblePercentageMin": 50})).visible_percentage_min, 0.5);
        assert_eq!(config(json!({"visiblePercentageMin": "50"})).visible_percentage_min, 0.5);
        assert_eq!(config(json!({"visiblePercentageMin": 100})).visible_percentage_min, 1.0);
        assert_eq!(config(json!({"visiblePercentageMin": "100"})).visible_percentage_min, 1.0);
    }

    #[test]
    fn parses_visible_percentage_max() {
        assert_eq!(config(json!({})).visible_percentage_max, 1.0);
        assert_eq!(config(json!({"visiblePercentageMax": ""})).visible_percentage_max, 1.0);
        assert_eq!(config(json!({"visiblePercentageMax": 0})).visible_percentage_max, 1.0);
        assert_eq!(config(json!({"visiblePercentageMax": "0"})).visible_percentage_max, 1.0);
        assert_eq!(config(json!({"visiblePercentageMax": 50})).visible_percentage_max, 0.5);
        assert_eq!(config(json!({"visiblePercentageMax": " 50 "})).visible_percentage_max, 0.5);
        assert_eq!(config(json!({"visiblePercentageMax": "100"})).visible_percentage_max, 1.0);
    }

    #[test]
    fn parses_time_bounds() {
        let defaults = config(json!({}));
        assert_eq!(defaults.total_time_min, 0.0);
        assert_eq!(defaults.total_time_max, f64::INFINITY);
        assert_eq!(defaults.continuous_time_min, 0.0);
        assert_eq!(defaults.continuous_time_max, f64::INFINITY);

        for input in [json!(""), json!(0), json!("0"), json!("abc"), json!([1, 2])] {
            let spec = config(json!({
                "totalTimeMin": input.clone(),
                "totalTimeMax": input.clone(),
                "continuousTimeMin": input.clone(),
                "continuousTimeMax": input,
            }));
            assert_eq!(spec.total_time_min, 0.0);
            assert_eq!(spec.total_time_max, f64::INFINITY);
            assert_eq!(spec.continuous_time_min, 0.0);
            assert_eq!(spec.continuous_time_max, f64::INFINITY);
        }

        let spec = config(json!({
            "totalTimeMin": "50",
            "totalTimeMax": 100,
            "continuousTimeMin": 50,
            "continuousTimeMax": "100",
        }));
        assert_eq!(spec.total_time_min, 50.0);
        assert_eq!(spec.total_time_max, 100.0);
        assert_eq!(spec.continuous_time_min, 50.0);
        assert_eq!(spec.continuous_time_max, 100.0);
    }

    #[test]
    fn numeric_strings_follow_number_conversion() {
        for input in ["inf", "INF", "infinity", "NaN", "nan", "0x", "0xZZ", "1_000", "12px"] {
            let spec = config(json!({"totalTimeMin": input, "totalTimeMax": input}));
            assert_eq!(spec.total_time_min, 0.0, "{input}");
            assert_eq!(spec.total_time_max, f64::INFINITY, "{input}");
        }

        assert_eq!(config(json!({"totalTimeMin": "0x10"})).total_time_min, 16.0);
        assert_eq!(config(json!({"totalTimeMin": "0b101"})).total_time_min, 5.0);
        assert_eq!(config(json!({"totalTimeMin": "1e3"})).total_time_min, 1000.0);
        assert_eq!(config(json!({"totalTimeMin": ".5"})).total_time_min, 0.5);
        assert_eq!(config(json!({"totalTimeMax": "Infinity"})).total_time_max, f64::INFINITY);
        assert_eq!(config(json!({"visiblePercentageMin": "0x32"})).visible_percentage_min, 0.5);
    }

    #[test]
    fn repeat_only_accepts_boolean_true() {
        assert!(config(json!({"repeat": true})).repeat);
        assert!(!config(json!({"repeat": "true"})).repeat);
        assert!(!config(json!({"repeat": "invalid"})).repeat);
        assert!(!config(json!({"repeat": "200"})).repeat);
        assert!(!config(json!({"repeat": 200})).repeat);
        assert!(!config(json!({})).repeat);
    }

    #[test]
    fn parses_report_when() {
        assert_eq!(config(json!({})).report_when, None);
        assert_eq!(config(json!({"reportWhen": ""})).report_when, None);
        assert_eq!(
            config(json!({"reportWhen": "documentExit"})).report_when,
            Some(ReportWhen::DocumentExit)
        );
        assert_eq!(
            config(json!({"reportWhen": "documentHidden"})).report_when,
            Some(ReportWhen::DocumentHidden)
        );

        let err = VisibilitySpec::parse(&json!({"reportWhen": "never"})).unwrap_err();
        assert!(err.to_string().contains("not supported"));

        let err = VisibilitySpec::parse(&json!({"reportWhen": "documentExit", "repeat": true}))
            .unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn rejects_non_object_specs() {
        assert!(VisibilitySpec::parse(&json!([1, 2])).is_err());
        assert!(VisibilitySpec::parse(&json!("visible")).is_err());
        assert_eq!(VisibilitySpec::parse(&Value::Null).unwrap(), VisibilitySpec::default());
    }

    #[test]
    fn matches_is_exclusive_min_inclusive_max() {
        let spec = config(json!({"visiblePercentageMin": 10, "visiblePercentageMax": 90}));
        assert!(!spec.matches(0.0));
        assert!(!spec.matches(0.1));
        assert!(spec.matches(0.1001));
        assert!(spec.matches(0.9));
        assert!(!spec.matches(0.90001));
        assert!(!spec.matches(1.0));

        let full = config(json!({"visiblePercentageMin": 100, "visiblePercentageMax": 100}));
        assert!(!full.matches(0.99));
        assert!(full.matches(1.0));
    }

    #[test]
    fn serializes_unbounded_maxima_as_null() {
        let value = serde_json::to_value(VisibilitySpec::default()).unwrap();
        assert_eq!(value["totalTimeMax"], Value::Null);
        assert_eq!(value["visiblePercentageMax"], json!(1.0));
        assert!(value.get("reportWhen").is_none());
    }
}
