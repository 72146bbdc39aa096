use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use offcache::clients::LocalClients;
use offcache::lifecycle::Progress;
use offcache::notify::TracingNotifier;
use offcache::{
  CacheStore, Config, Destination, Disposition, EventOutcome, HttpNetwork, LifecycleController,
  Network, Request, SqliteStore, WorkerEvent, WorkerSettings,
};
use reqwest::Method;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Parser, Debug)]
#[command(name = "offcache")]
#[command(about = "An offline-first caching proxy with versioned cache generations")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./offcache.yaml or $XDG_CONFIG_HOME/offcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured generation (activates too when skip_waiting is set)
  Install,
  /// Activate the installed generation and purge stale ones
  Activate,
  /// Request paths through the cache
  Fetch {
    #[arg(required = true)]
    paths: Vec<String>,
    /// HTTP method
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Treat requests as document navigations
    #[arg(long)]
    document: bool,
    /// Write the last response body to this file
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Print the current generation via the control channel
  Version,
  /// Send a raw control-channel message, e.g. '{"type":"SKIP_WAITING"}'
  Message { json: String },
  /// List generations in the store
  Generations,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = offcache::logging::init(&config.log)?;

  let store_path = config.store_path()?;
  let store = Arc::new(
    SqliteStore::open(&store_path)
      .map_err(|e| eyre!("Failed to open cache store at {}: {}", store_path.display(), e))?,
  );
  let network = Arc::new(
    HttpNetwork::new(config.origin.clone()).map_err(|e| eyre!("Failed to create client: {}", e))?,
  );

  let controller = LifecycleController::new(
    Arc::clone(&store),
    network.clone(),
    Arc::new(LocalClients::new()),
    Arc::new(TracingNotifier),
    WorkerSettings::from_config(&config)?,
  );
  controller.restore();

  let result = match args.command {
    Command::Install => report(controller.dispatch(WorkerEvent::Install).await, &controller),
    Command::Activate => report(controller.dispatch(WorkerEvent::Activate).await, &controller),
    Command::Fetch {
      paths,
      method,
      document,
      output,
    } => {
      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;
      let destination = if document {
        Destination::Document
      } else {
        Destination::Empty
      };

      let mut last_body = None;
      for path in &paths {
        let request = Request::new(method.clone(), config.resolve(path)?).with_destination(destination);
        last_body = fetch(&controller, network.as_ref(), request).await?;
      }
      if let (Some(output), Some(body)) = (output, last_body) {
        std::fs::write(&output, body)
          .map_err(|e| eyre!("Failed to write {}: {}", output.display(), e))?;
      }
      Ok(())
    }
    Command::Version => {
      let (tx, rx) = oneshot::channel();
      controller
        .message(&serde_json::json!({ "type": "GET_VERSION" }), Some(tx))
        .await;
      let reply = rx.await.map_err(|_| eyre!("No version reply"))?;
      println!("{}", reply.version);
      Ok(())
    }
    Command::Message { json } => {
      let data: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| eyre!("Invalid message JSON: {}", e))?;
      let (tx, rx) = oneshot::channel();
      let outcome = controller
        .dispatch(WorkerEvent::Message {
          data,
          reply: Some(tx),
        })
        .await;
      if let Ok(reply) = rx.await {
        println!("{}", serde_json::to_string(&reply)?);
      }
      report(outcome, &controller)
    }
    Command::Generations => {
      let current = controller.version();
      for generation in store.keys()? {
        let entries = store.entry_keys(&generation)?.len();
        let marker = if &generation == current { " (current)" } else { "" };
        println!("{}\t{} entries{}", generation, entries, marker);
      }
      Ok(())
    }
  };

  // Let background write-backs land before exiting
  controller.engine().flush().await;
  result
}

/// Run one request through the controller. Returns the body that was served.
async fn fetch(
  controller: &LifecycleController<SqliteStore>,
  network: &HttpNetwork,
  request: Request,
) -> Result<Option<Vec<u8>>> {
  let url = request.url.clone();
  match controller.dispatch(WorkerEvent::Fetch(request)).await {
    EventOutcome::Fetch(Disposition::Respond(served)) => {
      println!(
        "{} {}\t{}\t{} bytes",
        served.response.status,
        served.source,
        url,
        served.response.body.len()
      );
      Ok(Some(served.response.body))
    }
    EventOutcome::Fetch(Disposition::PassThrough(request)) => {
      // Not intercepted: the host performs the request itself
      let response = network
        .fetch(&request)
        .await
        .map_err(|e| eyre!("{}", e))?;
      println!(
        "{} passthrough\t{}\t{} bytes",
        response.status,
        url,
        response.body.len()
      );
      Ok(Some(response.body))
    }
    EventOutcome::Fetch(Disposition::Unavailable(e)) => {
      println!("--- unavailable\t{}\t{}", url, e);
      Ok(None)
    }
    other => Err(eyre!("Unexpected outcome for fetch: {:?}", other)),
  }
}

fn report(outcome: EventOutcome, controller: &LifecycleController<SqliteStore>) -> Result<()> {
  match outcome {
    EventOutcome::Lifecycle(Progress {
      installed,
      activated,
    }) => {
      if let Some(installed) = installed {
        let installed = installed.map_err(|e| eyre!("Install failed: {}", e))?;
        println!(
          "installed {} ({} entries)",
          installed.generation, installed.entries
        );
      }
      if let Some(activated) = activated {
        let report = activated.map_err(|e| eyre!("Activation failed: {}", e))?;
        for generation in &report.deleted {
          println!("deleted {}", generation);
        }
        for failure in &report.failures {
          println!("warning: {}", failure);
        }
        println!("activated {}", controller.version());
      }
    }
    EventOutcome::Ignored => println!("ignored in state {}", controller.state()),
    EventOutcome::Handled | EventOutcome::Fetch(_) => {}
  }
  println!("state: {}", controller.state());
  Ok(())
}
