pub mod cli;
pub mod commands;
pub mod config;
pub mod datetime;
pub mod index;
pub mod persist;
pub mod priority;
pub mod reminders;
pub mod render;
pub mod settings;
pub mod storage;
pub mod store;
pub mod todo;

use std::ffi::OsString;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{
  debug,
  info
};

use crate::config::{
  KEY_PERSIST_DEBOUNCE,
  KEY_SETTINGS_DEBOUNCE,
  KEY_TIMEZONE
};
use crate::settings::{
  DEFAULT_SETTINGS_DEBOUNCE,
  SettingsStore
};
use crate::storage::{
  FileBackend,
  Storage,
  StorageBackend
};
use crate::store::{
  DEFAULT_PERSIST_DEBOUNCE,
  TodoStore
};

pub const TODOS_NAMESPACE: &str =
  "todos";
pub const SETTINGS_NAMESPACE: &str =
  "settings";

#[tracing::instrument(skip_all)]
pub fn run(
  raw_args: Vec<OsString>
) -> anyhow::Result<()> {
  let pre =
    cli::preprocess_args(&raw_args);
  let cli = cli::GlobalCli::parse_from(
    pre.cleaned_args
  );

  cli::init_tracing(
    cli.verbose,
    cli.quiet
  )?;

  info!(
    verbose = cli.verbose,
    quiet = cli.quiet,
    "starting nudge CLI"
  );
  debug!(?pre.rc_overrides, "preprocessed rc overrides");

  let mut cfg = config::Config::load(
    cli.config.as_deref()
  )?;
  cfg.apply_overrides(
    pre.rc_overrides.into_iter().chain(
      cli
        .rc_overrides
        .into_iter()
        .map(|kv| (kv.key, kv.value))
    )
  );

  let data_dir =
    config::resolve_data_dir(
      &cfg,
      cli.data.as_deref()
    )
    .context(
      "failed to resolve data \
       directory"
    )?;
  let tz = datetime::resolve_timezone(
    cfg.get(KEY_TIMEZONE).as_deref()
  );
  let persist_delay = cfg.millis(
    KEY_PERSIST_DEBOUNCE,
    DEFAULT_PERSIST_DEBOUNCE
  )?;
  let settings_delay = cfg.millis(
    KEY_SETTINGS_DEBOUNCE,
    DEFAULT_SETTINGS_DEBOUNCE
  )?;

  let backend: Arc<dyn StorageBackend> =
    Arc::new(
      FileBackend::open(&data_dir)
        .with_context(|| {
          format!(
            "failed to open storage at \
             {}",
            data_dir.display()
          )
        })?
    );

  let renderer =
    render::Renderer::new(&cfg)?;
  let command = cli.command;

  let runtime =
    tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
      .context(
        "failed to start async runtime"
      )?;

  runtime.block_on(async move {
    let mut todos = TodoStore::new(
      Arc::new(Storage::open(
        TODOS_NAMESPACE,
        Arc::clone(&backend)
      )),
      tz
    )
    .with_debounce(persist_delay);
    todos.load().await;

    let mut settings =
      SettingsStore::new(Arc::new(
        Storage::open(
          SETTINGS_NAMESPACE,
          backend
        )
      ))
      .with_debounce(settings_delay);
    settings.load().await;

    let mut session =
      commands::Session {
        todos,
        settings
      };
    let result = commands::dispatch(
      &mut session,
      &renderer,
      &cfg,
      command
    )
    .await;
    session.flush();
    result
  })?;

  info!("done");
  Ok(())
}
