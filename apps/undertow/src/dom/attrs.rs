/// Attributes whose presence alone carries meaning.
pub const BOOLEAN_ATTRIBUTES: &[&str] = &[
    "checked",
    "disabled",
    "selected",
    "readonly",
    "required",
    "hidden",
    "multiple",
    "autofocus",
    "open",
    "novalidate",
    "formnovalidate",
];

pub fn is_boolean(name: &str) -> bool {
    BOOLEAN_ATTRIBUTES
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(name))
}

/// `onclick`, `OnLoad` and friends. The server may never set these.
pub fn is_event_handler(name: &str) -> bool {
    name.len() > 2
        && name
            .get(..2)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("on"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrChange {
    Set(String),
    Remove,
}

/// Boolean attributes map `"false"` to removal and anything else to presence.
pub fn normalize(name: &str, value: &str) -> AttrChange {
    if is_boolean(name) {
        if value.eq_ignore_ascii_case("false") {
            AttrChange::Remove
        } else {
            AttrChange::Set(String::new())
        }
    } else {
        AttrChange::Set(value.to_string())
    }
}

pub fn class_list(value: &str) -> Vec<&str> {
    value.split_ascii_whitespace().collect()
}

pub fn with_class(value: Option<&str>, class: &str) -> String {
    let mut classes = value.map(class_list).unwrap_or_default();
    if !classes.contains(&class) {
        classes.push(class);
    }
    classes.join(" ")
}

/// `None` when no class remains.
pub fn without_class(value: &str, class: &str) -> Option<String> {
    let classes: Vec<&str> = class_list(value)
        .into_iter()
        .filter(|candidate| *candidate != class)
        .collect();
    (!classes.is_empty()).then(|| classes.join(" "))
}

pub fn parse_style(value: &str) -> Vec<(String, String)> {
    value
        .split(';')
        .filter_map(|declaration| {
            let (property, value) = declaration.split_once(':')?;
            let property = property.trim();
            (!property.is_empty()).then(|| (property.to_string(), value.trim().to_string()))
        })
        .collect()
}

pub fn format_style(declarations: &[(String, String)]) -> Option<String> {
    if declarations.is_empty() {
        return None;
    }
    Some(
        declarations
            .iter()
            .map(|(property, value)| format!("{property}: {value}"))
            .collect::<Vec<_>>()
            .join("; "),
    )
}
