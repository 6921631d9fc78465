//! IDs of the components a forwarder compiles into. Every ID must be unique within a
//! forwarder, [`crate::LogForwarderSpec::validate`] rejects names that would collide.

/// Lowercases a name and replaces everything outside `[a-z0-9_]` with `_`, so that it can be
/// used as a component ID in any collector configuration.
pub fn component_id(name: &str) -> String {
    name.chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' => c,
            _ => '_',
        })
        .collect()
}

pub fn input_id(input_name: &str) -> String {
    format!("input_{}", component_id(input_name))
}

pub fn receiver_id(input_id: &str) -> String {
    format!("{input_id}_receiver")
}

pub fn pipeline_id(pipeline_name: &str) -> String {
    format!("pipeline_{}", component_id(pipeline_name))
}

pub fn filter_id(pipeline_id: &str, filter_name: &str) -> String {
    format!("{pipeline_id}_{}", component_id(filter_name))
}

pub fn output_id(output_name: &str) -> String {
    format!("output_{}", component_id(output_name))
}
