use anyhow::Result;
use tileforge::{server, state};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use std::sync::Arc;
use tileforge_core::Settings;

#[derive(Parser, Debug)]
#[command(
	author,
	version,
	about,
	long_about = None,
	propagate_version = true,
	disable_help_subcommand = true,
)]
struct Cli {
	#[command(subcommand)]
	command: Commands,

	#[command(flatten)]
	verbose: Verbosity<InfoLevel>,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Serve cached tiles and OGC endpoints over HTTP
	Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
	/// Address to bind
	#[arg(long, default_value = "0.0.0.0")]
	ip: String,

	/// Port to bind
	#[arg(short, long, default_value_t = 8080)]
	port: u16,

	/// Tile cache directory
	#[arg(long, default_value = "./cache")]
	cache_dir: PathBuf,

	/// Directory holding uploaded project files
	#[arg(long, default_value = "./projects")]
	projects_dir: PathBuf,

	/// Directory holding tile-matrix presets
	#[arg(long, default_value = "./presets")]
	presets_dir: PathBuf,

	/// Renderer subprocess command (program plus arguments)
	#[arg(long, default_value = "qgis-renderer", num_args = 1.., value_delimiter = ' ')]
	renderer: Vec<String>,

	/// Number of persistent renderer workers
	#[arg(long, default_value_t = 2)]
	workers: usize,

	/// Allowed CORS origins (repeatable; `*`, `prefix*`, `*suffix`, `/regex/`)
	#[arg(long = "cors-origin")]
	cors_origins: Vec<String>,
}

fn main() -> Result<()> {
	let cli = Cli::parse();

	env_logger::Builder::new()
		.filter_level(cli.verbose.log_level_filter())
		.format_timestamp(None)
		.init();

	match cli.command {
		Commands::Serve(args) => serve(args),
	}
}

fn serve(args: ServeArgs) -> Result<()> {
	let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
	runtime.block_on(async move {
		let settings = Arc::new(Settings::from_env());
		let state = state::AppState::build(
			settings,
			args.cache_dir,
			args.projects_dir,
			args.presets_dir,
			args.renderer,
			args.workers,
		)?;

		let mut server = server::TileServer::new(&args.ip, args.port, state.clone(), args.cors_origins);
		server.start().await?;

		tokio::signal::ctrl_c().await?;
		log::info!("shutdown signal received");
		server.stop().await;
		state.pool.close().await;
		Ok(())
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn help_lists_the_serve_subcommand() {
		let err = Cli::try_parse_from(["tileforge"]).unwrap_err().to_string();
		assert!(err.contains("Usage: tileforge"));
		assert!(err.contains("serve"));
	}

	#[test]
	fn version_flag_works() {
		let err = Cli::try_parse_from(["tileforge", "-V"]).unwrap_err().to_string();
		assert!(err.starts_with("tileforge "));
	}

	#[test]
	fn serve_parses_renderer_command() {
		let cli = Cli::try_parse_from([
			"tileforge",
			"serve",
			"--renderer",
			"python3 render_worker.py",
			"--port",
			"9090",
		])
		.unwrap();
		let Commands::Serve(args) = cli.command;
		assert_eq!(args.port, 9090);
		assert_eq!(args.renderer, vec!["python3", "render_worker.py"]);
	}
}
