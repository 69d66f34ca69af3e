//! GridSync hub server.
//!
//! ```text
//! gridsync-server                   serve documents over WebSocket
//! gridsync-server new [kind]        create a document (sheet, doc, slide) and print its id
//! gridsync-server list              print stored document ids with kind and version
//! gridsync-server show <id>         print a document's kind and stored config
//! gridsync-server update <id> <f>   replace a document's config with the JSON in file f
//! gridsync-server delete <id>       remove a document
//! ```
//!
//! Configuration comes from `.env` and `GRIDSYNC_*` variables; see
//! `gridsync_collab::config`.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use gridsync_collab::config::ServerConfig;
use gridsync_collab::server::HubServer;
use gridsync_collab::storage::{DocumentStore, MemoryStore, PersistenceGateway, StoreConfig};
use gridsync_core::DocumentKind;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

enum Command {
    Serve,
    Store(StoreCommand),
}

/// Offline commands against the configured document store.
enum StoreCommand {
    New(DocumentKind),
    List,
    Show(String),
    Update { doc_id: String, file: PathBuf },
    Delete(String),
}

impl StoreCommand {
    fn writes(&self) -> bool {
        !matches!(self, StoreCommand::List | StoreCommand::Show(_))
    }
}

fn doc_id(args: &mut impl Iterator<Item = String>, command: &str) -> Result<String, BoxError> {
    args.next()
        .ok_or_else(|| format!("{command} needs a document id").into())
}

fn parse_command(mut args: impl Iterator<Item = String>) -> Result<Command, BoxError> {
    let command = match args.next().as_deref() {
        None | Some("serve") => return Ok(Command::Serve),
        Some("new") => {
            let kind = match args.next() {
                Some(kind) => kind.parse::<DocumentKind>()?,
                None => DocumentKind::Sheet,
            };
            StoreCommand::New(kind)
        }
        Some("list") => StoreCommand::List,
        Some("show") => StoreCommand::Show(doc_id(&mut args, "show")?),
        Some("update") => {
            let id = doc_id(&mut args, "update")?;
            let file = args.next().ok_or("update needs a config file")?;
            StoreCommand::Update {
                doc_id: id,
                file: file.into(),
            }
        }
        Some("delete") => StoreCommand::Delete(doc_id(&mut args, "delete")?),
        Some(other) => {
            return Err(format!(
                "unknown command {other:?} (expected serve, new, list, show, update or delete)"
            )
            .into())
        }
    };
    Ok(Command::Store(command))
}

fn open_store(config: &ServerConfig) -> Result<DocumentStore, BoxError> {
    let path = config
        .storage_path
        .clone()
        .ok_or("this command needs persistent storage (unset GRIDSYNC_IN_MEMORY)")?;
    Ok(DocumentStore::open(StoreConfig {
        path,
        ..StoreConfig::default()
    })?)
}

fn run_store_command(
    store: &DocumentStore,
    command: StoreCommand,
    out: &mut impl Write,
) -> Result<(), BoxError> {
    let writes = command.writes();
    match command {
        StoreCommand::New(kind) => {
            let record = store.create_document(kind)?;
            writeln!(out, "{}", record.doc_id)?;
        }
        StoreCommand::List => {
            for doc_id in store.list_documents()? {
                let meta = store.load_metadata(&doc_id)?;
                writeln!(out, "{doc_id}\t{}\tv{}\t{} bytes", meta.kind, meta.version, meta.config_size)?;
            }
        }
        StoreCommand::Show(doc_id) => {
            let record = store.load_document(&doc_id)?;
            writeln!(out, "{}\t{}", record.doc_id, record.kind)?;
            writeln!(out, "{}", record.config)?;
        }
        StoreCommand::Update { doc_id, file } => {
            let config = std::fs::read_to_string(&file)?;
            let meta = store.update_config(&doc_id, &config)?;
            writeln!(out, "{doc_id}\tv{}\t{} bytes", meta.version, meta.config_size)?;
        }
        StoreCommand::Delete(doc_id) => {
            store.delete_document(&doc_id)?;
            writeln!(out, "deleted {doc_id}")?;
        }
    }
    if writes {
        store.sync()?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    let command = parse_command(std::env::args().skip(1))?;
    let config = ServerConfig::from_env()?;

    match command {
        Command::Store(command) => {
            let store = open_store(&config)?;
            run_store_command(&store, command, &mut std::io::stdout().lock())?;
        }
        Command::Serve => {
            let gateway: Arc<dyn PersistenceGateway> = match &config.storage_path {
                Some(_) => Arc::new(open_store(&config)?),
                None => {
                    info!("Running with in-memory storage; documents are lost on exit");
                    Arc::new(MemoryStore::new())
                }
            };

            info!("Starting GridSync hub on {}...", config.bind_addr);
            HubServer::new(config, gateway).run().await?;
        }
    }

    Ok(())
}
