// Bindings Module - Maps snapshot field names to panel update strategies
//
// The device names its top-level fields after the input elements of its own
// web page. This table keeps that coupling in one place: explicit rules first,
// then a plain value binding for any field that names a known element, and
// finally the unknown-field policy.
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomBinding {
    /// Readout text plus slider: "DISABLED" disables it, "Off" zeroes it
    ButtonOutput,
    /// Input value plus the button card title
    ButtonName,
    /// Checkbox that also toggles the MQTT credential fields
    MqttAuth,
    /// Status tag whose class and error banner follow "Connected"
    ConnectionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
    SetValue,
    SetHtml,
    SetChecked,
    Custom(CustomBinding),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub element: String,
    pub strategy: UpdateStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownFieldPolicy {
    LogAndSkip,
    Ignore,
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact(&'static str),
    Affixes(&'static str, &'static str),
}

impl Matcher {
    fn matches(&self, field: &str) -> bool {
        match self {
            Matcher::Exact(name) => field == *name,
            Matcher::Affixes(prefix, suffix) => {
                field.len() >= prefix.len() + suffix.len()
                    && field.starts_with(prefix)
                    && field.ends_with(suffix)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    matcher: Matcher,
    // Element the field lands on when it differs from the field name
    element: Option<&'static str>,
    strategy: UpdateStrategy,
    // Only applies when the field names a registered element
    registered_only: bool,
}

#[derive(Debug, Clone)]
pub struct BindingTable {
    rules: Vec<Rule>,
    elements: BTreeSet<String>,
    unknown: UnknownFieldPolicy,
}

impl BindingTable {
    /// The rule set the controller firmware expects, over the given element ids
    pub fn standard<I, S>(elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        use CustomBinding::*;
        use UpdateStrategy::*;

        let rule = |matcher, element, strategy| Rule {
            matcher,
            element,
            strategy,
            registered_only: false,
        };

        let rules = vec![
            rule(Matcher::Affixes("button", "_output"), None, Custom(ButtonOutput)),
            rule(Matcher::Affixes("button", "_name"), None, Custom(ButtonName)),
            rule(Matcher::Affixes("button", "_enabled"), None, SetChecked),
            rule(Matcher::Exact("mqtt_auth"), None, Custom(MqttAuth)),
            rule(Matcher::Exact("mqtt_status"), None, Custom(ConnectionStatus)),
            rule(Matcher::Exact("home_assistant_status"), None, Custom(ConnectionStatus)),
            rule(Matcher::Exact("log_level"), None, SetValue),
            rule(Matcher::Exact("button_min_time"), Some("button_min_press"), SetValue),
            rule(Matcher::Exact("button_max_time"), Some("button_max_press"), SetValue),
            // Other status readouts are text, but only on elements the panel has
            Rule {
                registered_only: true,
                ..rule(Matcher::Affixes("", "_status"), None, SetHtml)
            },
        ];

        BindingTable {
            rules,
            elements: elements.into_iter().map(Into::into).collect(),
            unknown: UnknownFieldPolicy::LogAndSkip,
        }
    }

    pub fn with_unknown_policy(mut self, policy: UnknownFieldPolicy) -> Self {
        self.unknown = policy;
        self
    }

    pub fn unknown_policy(&self) -> UnknownFieldPolicy {
        self.unknown
    }

    /// Resolve a field to its binding, or None when the unknown-field policy applies
    pub fn resolve(&self, field: &str) -> Option<Binding> {
        let registered = self.elements.contains(field);
        if let Some(rule) = self
            .rules
            .iter()
            .find(|r| r.matcher.matches(field) && (registered || !r.registered_only))
        {
            return Some(Binding {
                element: rule.element.unwrap_or(field).to_string(),
                strategy: rule.strategy,
            });
        }

        if registered {
            return Some(Binding {
                element: field.to_string(),
                strategy: UpdateStrategy::SetValue,
            });
        }

        None
    }
}
