use graphvault::{Graph, GraphConfig, GraphSession, Result, VertexId};
use std::path::Path;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const NAME: &str = "name";
const OWNS: &str = "owns";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run() {
        error!("Demo failed: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    // An optional TOML file may point the demo somewhere other than ./db.
    let config = match std::env::args().nth(1) {
        Some(path) => GraphConfig::load_from_file(Path::new(&path))?,
        None => GraphConfig::new("./db"),
    }
    .with_index(NAME);

    let seed = !config.storage_directory.exists();
    let graph = Graph::open(config)?;
    let mut session = graph.session();

    if seed {
        create_sample_data(&mut session)?;
    }

    match session.vertex_by_property(NAME, "Microsoft")? {
        Some(root) => {
            info!("Found the root {}", root.property(NAME).unwrap_or_default());
            log_subsidiaries(&mut session, root.id)?;
        }
        None => warn!("No vertex named Microsoft"),
    }

    session.shutdown()
}

fn create_sample_data(session: &mut GraphSession) -> Result<()> {
    let microsoft = named_vertex(session, "Microsoft")?;
    let nokia = named_vertex(session, "NOKIA")?;
    let apiphany = named_vertex(session, "Apiphany")?;

    session.add_edge(microsoft, nokia, OWNS)?;
    session.add_edge(microsoft, apiphany, OWNS)?;
    session.commit()
}

fn named_vertex(session: &mut GraphSession, name: &str) -> Result<VertexId> {
    let id = session.add_vertex()?;
    session.set_property(id, NAME, name)?;
    Ok(id)
}

fn log_subsidiaries(session: &mut GraphSession, root: VertexId) -> Result<()> {
    for subsidiary in session.neighbors(root, OWNS)? {
        let subsidiary = subsidiary?;
        info!("Subsidiary is {}", subsidiary.property(NAME).unwrap_or_default());
    }
    Ok(())
}
