use crate::output::UserOutput;
use devfleet::dependency::Graph;
use devfleet::FleetConfig;

/// Print the start levels, one line per level.
pub fn run_graph(config: &FleetConfig, out: &dyn UserOutput) -> anyhow::Result<()> {
    let graph = Graph::build(&config.services)?;

    if graph.is_empty() {
        out.warning("No services declared");
        return Ok(());
    }

    for (index, level) in graph.levels().iter().enumerate() {
        out.status(&format!("level {}: {}", index, level.join(", ")));
    }
    for name in graph.nodes() {
        let deps = graph.get_direct_dependencies(name);
        if !deps.is_empty() {
            out.status(&format!("  {} -> {}", name, deps.join(", ")));
        }
    }
    Ok(())
}
