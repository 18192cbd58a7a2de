use serde::{Deserialize, Serialize};

/// Strategy half of a locator spec.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorKind {
    Selector,
    Xpath,
    Text,
    Role,
    Id,
    Class,
}

/// Tagged description of how to find an element.
///
/// Scripts carry these instead of raw selector strings so the mapping to the
/// driver's native selector syntax happens in exactly one place
/// ([`LocatorSpec::to_driver_selector`]), keeping it auditable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocatorSpec {
    #[serde(rename = "strategy")]
    pub kind: LocatorKind,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nth: Option<usize>,
}

impl LocatorSpec {
    pub fn selector(value: impl Into<String>) -> Self {
        Self {
            kind: LocatorKind::Selector,
            value: value.into(),
            nth: None,
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self {
            kind: LocatorKind::Text,
            value: value.into(),
            nth: None,
        }
    }

    pub fn nth(mut self, index: usize) -> Self {
        self.nth = Some(index);
        self
    }

    /// Compile the spec down to the selector string the driver understands.
    /// An `nth` index wraps the result in the driver's `nth=<i>:` prefix so
    /// the i-th match is resolved instead of the first.
    pub fn to_driver_selector(&self) -> String {
        let base = match self.kind {
            LocatorKind::Selector => self.value.clone(),
            LocatorKind::Xpath => format!("xpath={}", self.value),
            LocatorKind::Text => format!("text={}", self.value),
            LocatorKind::Role => self.value.clone(),
            LocatorKind::Id => format!("#{}", self.value),
            LocatorKind::Class => format!(".{}", self.value),
        };
        match self.nth {
            Some(nth) => format!("nth={nth}:{base}"),
            None => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_compilation_covers_every_strategy() {
        let cases = [
            (LocatorKind::Selector, "button.primary", "button.primary"),
            (LocatorKind::Xpath, "//a[1]", "xpath=//a[1]"),
            (LocatorKind::Text, "Sign in", "text=Sign in"),
            (LocatorKind::Role, "button[name='Go']", "button[name='Go']"),
            (LocatorKind::Id, "submit", "#submit"),
            (LocatorKind::Class, "cta", ".cta"),
        ];
        for (kind, value, expected) in cases {
            let spec = LocatorSpec {
                kind,
                value: value.to_string(),
                nth: None,
            };
            assert_eq!(spec.to_driver_selector(), expected);
        }
    }

    #[test]
    fn nth_wraps_the_compiled_selector() {
        let spec = LocatorSpec::selector("li.result").nth(2);
        assert_eq!(spec.to_driver_selector(), "nth=2:li.result");
        let text = LocatorSpec::text("Add to cart").nth(1);
        assert_eq!(text.to_driver_selector(), "nth=1:text=Add to cart");
        // No index, no wrapper.
        assert_eq!(
            LocatorSpec::selector("li.result").to_driver_selector(),
            "li.result"
        );
    }

    #[test]
    fn locator_round_trips_through_json() {
        let spec = LocatorSpec::text("Add to cart").nth(2);
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["strategy"], "text");
        let back: LocatorSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }
}
