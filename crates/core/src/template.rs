use serde_json::{Map, Value};

/// Replaces `{path}` placeholders with values looked up in `variables`.
///
/// Paths are dot separated and walk into nested objects. Strings are inserted verbatim, other
/// values as compact JSON. Placeholders that do not resolve are left in place.
pub fn render(template: &str, variables: &Map<String, Value>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        output.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];

        let Some(close) = after_open.find(['{', '}']).filter(|&i| after_open[i..].starts_with('}'))
        else {
            output.push('{');
            rest = after_open;
            continue;
        };

        let path = &after_open[..close];
        match lookup(variables, path.trim()) {
            Some(value) => output.push_str(&display(value)),
            None => {
                output.push('{');
                output.push_str(path);
                output.push('}');
            }
        }
        rest = &after_open[close + 1..];
    }

    output.push_str(rest);
    output
}

/// Resolves a dotted path against the variables. Returns `None` when any segment is missing.
pub fn lookup<'a>(variables: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next().filter(|segment| !segment.is_empty())?;
    let mut current = variables.get(first)?;

    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

fn display(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
