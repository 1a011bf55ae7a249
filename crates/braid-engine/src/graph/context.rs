//! Input rendering for dependent nodes.
//!
//! A node sees the base input plus the outputs of its direct dependencies,
//! nothing further up the graph.

const HEADING: &str = "--- Previous results ---";

/// Render `(id, output)` pairs as `[id]: output` lines.
pub fn render_outputs<'a>(outputs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    outputs
        .into_iter()
        .map(|(id, output)| format!("[{}]: {}", id, output))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build a node's input from the base input and its direct dependencies'
/// outputs, in the order given. With no dependencies the base is unchanged.
pub fn build_node_input<'a>(
    base: &str,
    dependencies: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> String {
    let rendered = render_outputs(dependencies);
    if rendered.is_empty() {
        return base.to_string();
    }
    format!("{}\n\n{}\n{}", base, HEADING, rendered)
}
