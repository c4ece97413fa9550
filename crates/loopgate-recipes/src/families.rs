/// Family selected when a recipe does not name one.
pub const DEFAULT_FAMILY: &str = "PI";

/// Starting value for any gain that a family does not list.
pub const DEFAULT_GAIN: f64 = 1.0;

/// Known controller families and the base value of each gain they expose.
const FAMILY_DEFAULTS: &[(&str, &[(&str, f64)])] = &[
    ("P", &[("Kp", DEFAULT_GAIN)]),
    ("PI", &[("Kp", DEFAULT_GAIN), ("Ki", DEFAULT_GAIN)]),
    (
        "PID",
        &[("Kp", DEFAULT_GAIN), ("Ki", DEFAULT_GAIN), ("Kd", DEFAULT_GAIN)],
    ),
];

pub fn is_known_family(family: &str) -> bool {
    FAMILY_DEFAULTS.iter().any(|(name, _)| *name == family)
}

/// Value a gain takes before any action in the recipe touched it.
pub fn base_gain(family: &str, param: &str) -> f64 {
    FAMILY_DEFAULTS
        .iter()
        .find(|(name, _)| *name == family)
        .and_then(|(_, gains)| gains.iter().find(|(key, _)| *key == param))
        .map(|(_, value)| *value)
        .unwrap_or(DEFAULT_GAIN)
}
