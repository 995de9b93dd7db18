//! Envelope path parsing: map a path to (scope, feature id, inner pointer).

/// The resource a command path addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Scope {
    Unknown,

    Thing,
    Attributes,
    Definition,
    Policy,

    Features,
    Feature,
    FeatureDefinition,
    FeatureProperties,
    FeatureProperty,
    FeatureDesiredProperties,
    FeatureDesiredProperty,
}

/// A parsed command path.
///
/// `target` is the feature id for feature-scoped paths (or the attribute
/// pointer for `/attributes/...`), `pointer` the inner JSON pointer for
/// property-level paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourcePath {
    pub scope: Scope,
    pub target: Option<String>,
    pub pointer: Option<String>,
}

impl ResourcePath {
    fn new(scope: Scope) -> Self {
        Self {
            scope,
            target: None,
            pointer: None,
        }
    }

    fn with_target(scope: Scope, target: &str) -> Self {
        Self {
            scope,
            target: Some(target.to_string()),
            pointer: None,
        }
    }

    fn with_pointer(scope: Scope, target: &str, pointer: String) -> Self {
        Self {
            scope,
            target: Some(target.to_string()),
            pointer: Some(pointer),
        }
    }
}

/// Parse an envelope path against the exhaustive path table.
///
/// Anything outside the table (including an empty feature id) is
/// `Scope::Unknown`, which the handler treats as a protocol error.
pub fn parse(path: &str) -> ResourcePath {
    if path == "/" {
        return ResourcePath::new(Scope::Thing);
    }
    let Some(rest) = path.strip_prefix('/') else {
        return ResourcePath::new(Scope::Unknown);
    };

    let segments: Vec<&str> = rest.split('/').collect();
    match segments.as_slice() {
        ["attributes"] => ResourcePath::new(Scope::Attributes),
        ["attributes", tail @ ..] if !tail.is_empty() => {
            ResourcePath::with_target(Scope::Attributes, &format!("/{}", tail.join("/")))
        }
        ["definition"] => ResourcePath::new(Scope::Definition),
        ["policyId"] => ResourcePath::new(Scope::Policy),
        ["features"] => ResourcePath::new(Scope::Features),
        ["features", feature] if !feature.is_empty() => {
            ResourcePath::with_target(Scope::Feature, feature)
        }
        ["features", feature, "definition"] if !feature.is_empty() => {
            ResourcePath::with_target(Scope::FeatureDefinition, feature)
        }
        ["features", feature, "properties"] if !feature.is_empty() => {
            ResourcePath::with_target(Scope::FeatureProperties, feature)
        }
        ["features", feature, "desiredProperties"] if !feature.is_empty() => {
            ResourcePath::with_target(Scope::FeatureDesiredProperties, feature)
        }
        ["features", feature, "properties", tail @ ..] if !feature.is_empty() => {
            ResourcePath::with_pointer(
                Scope::FeatureProperty,
                feature,
                format!("/{}", tail.join("/")),
            )
        }
        ["features", feature, "desiredProperties", tail @ ..] if !feature.is_empty() => {
            ResourcePath::with_pointer(
                Scope::FeatureDesiredProperty,
                feature,
                format!("/{}", tail.join("/")),
            )
        }
        _ => ResourcePath::new(Scope::Unknown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(path: &str) -> Scope {
        parse(path).scope
    }

    #[test]
    fn full_path_table() {
        assert_eq!(scope("/"), Scope::Thing);
        assert_eq!(scope("/attributes"), Scope::Attributes);
        assert_eq!(scope("/definition"), Scope::Definition);
        assert_eq!(scope("/policyId"), Scope::Policy);
        assert_eq!(scope("/features"), Scope::Features);

        let parsed = parse("/attributes/location/lat");
        assert_eq!(parsed.scope, Scope::Attributes);
        assert_eq!(parsed.target.as_deref(), Some("/location/lat"));

        let parsed = parse("/features/meter");
        assert_eq!(parsed.scope, Scope::Feature);
        assert_eq!(parsed.target.as_deref(), Some("meter"));

        assert_eq!(scope("/features/meter/definition"), Scope::FeatureDefinition);
        assert_eq!(scope("/features/meter/properties"), Scope::FeatureProperties);
        assert_eq!(
            scope("/features/meter/desiredProperties"),
            Scope::FeatureDesiredProperties
        );

        let parsed = parse("/features/meter/properties/x/y");
        assert_eq!(parsed.scope, Scope::FeatureProperty);
        assert_eq!(parsed.target.as_deref(), Some("meter"));
        assert_eq!(parsed.pointer.as_deref(), Some("/x/y"));

        let parsed = parse("/features/meter/desiredProperties/x");
        assert_eq!(parsed.scope, Scope::FeatureDesiredProperty);
        assert_eq!(parsed.pointer.as_deref(), Some("/x"));
    }

    #[test]
    fn unknown_paths() {
        assert_eq!(scope(""), Scope::Unknown);
        assert_eq!(scope("features"), Scope::Unknown);
        assert_eq!(scope("/nowhere"), Scope::Unknown);
        assert_eq!(scope("/features/"), Scope::Unknown);
        assert_eq!(scope("/features/meter/unknown"), Scope::Unknown);
        assert_eq!(scope("/policyId/extra"), Scope::Unknown);
    }
}
