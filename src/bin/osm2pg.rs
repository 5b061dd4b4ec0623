use anstyle::{AnsiColor, Style};
use clap::Parser;
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use osm_pgsql_rust::driver::Osmdata;
use osm_pgsql_rust::input::InputHandler;
use osm_pgsql_rust::middle::pgsql::PgMiddle;
use osm_pgsql_rust::middle::ram::RamMiddle;
use osm_pgsql_rust::middle::Middle;
use osm_pgsql_rust::options::{Options, DEFAULT_SCALE};
use osm_pgsql_rust::osm::BoundingBox;
use osm_pgsql_rust::output::pgsql::PgsqlOutput;
use osm_pgsql_rust::output::Output;
use osm_pgsql_rust::{copy, osc, pbf};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Input file: .osm.pbf, or .osc/.osc.gz with --append
    pub input: PathBuf,

    #[arg(short, long, help = "Database connection string")]
    pub database: String,

    #[arg(long, help = "Apply a change file to an existing database")]
    pub append: bool,

    #[arg(long, help = "Store ways/relations in the database (needed for --append)")]
    pub slim: bool,

    #[arg(long, help = "Only import nodes inside minLon,minLat,maxLon,maxLat")]
    pub bbox: Option<String>,

    #[arg(long, default_value_t = 1, help = "Number of worker threads")]
    pub number_processes: usize,

    #[arg(long, help = "Drop the slim middle tables after import")]
    pub drop: bool,

    #[arg(long, help = "Build indexes on one connection at a time")]
    pub disable_parallel_indexing: bool,

    #[arg(long, help = "Also output objects without tags")]
    pub extra_attributes: bool,

    #[arg(long, help = "Do not reprocess parents of changed objects")]
    pub no_forward_dependencies: bool,

    #[arg(long, help = "Store node locations in this flat file")]
    pub flat_nodes: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_SCALE, help = "Fixed-point scale for cached coordinates")]
    pub scale: i32,

    #[arg(long, default_value_t = 800, help = "Node cache size in MB; 0 keeps nodes in the database")]
    pub cache: usize,

    #[arg(long, default_value = "", help = "Schema for the middle tables")]
    pub middle_schema: String,

    #[arg(long, default_value = "planet_osm", help = "Table name prefix")]
    pub prefix: String,

    #[arg(long, default_value_t = 3857, help = "SRID of the output geometry (4326 or 3857)")]
    pub srid: i32,

    #[arg(long, default_value = "", help = "Tablespace for output tables")]
    pub tablespace_data: String,

    #[arg(long, default_value = "", help = "Tablespace for output indexes")]
    pub tablespace_index: String,

    #[arg(long, help = "Record tiles dirtied by changes, at this zoom")]
    pub expire_tiles_zoom: Option<u32>,

    #[arg(long, default_value_t = 0, help = "Lowest zoom written to the expiry file")]
    pub expire_tiles_zoom_min: u32,

    #[arg(long, default_value = "dirty_tiles", help = "File for the expiry list")]
    pub expire_output: PathBuf,
}

fn error_exit(message: &str) -> ExitCode {
    let red = Style::new().fg_color(Some(AnsiColor::Red.into()));
    eprintln!("{red}Error: {message}{red:#}");
    ExitCode::from(1)
}

fn build_options(args: &Args) -> Result<Options, Box<dyn Error>> {
    let bbox: Option<BoundingBox> = match &args.bbox {
        Some(s) => Some(s.parse()?),
        None => None,
    };
    let opts = Options {
        conninfo: args.database.clone(),
        append: args.append,
        slim: args.slim,
        bbox,
        num_procs: args.number_processes,
        droptemp: args.drop,
        parallel_indexing: !args.disable_parallel_indexing,
        extra_attributes: args.extra_attributes,
        with_forward_dependencies: !args.no_forward_dependencies,
        flat_node_file: args.flat_nodes.clone(),
        scale: args.scale,
        cache_size_mb: args.cache,
        middle_schema: args.middle_schema.clone(),
        prefix: args.prefix.clone(),
        srid: args.srid,
        tablespace_data: args.tablespace_data.clone(),
        tablespace_index: args.tablespace_index.clone(),
        expire_tiles_zoom: args.expire_tiles_zoom,
        expire_tiles_zoom_min: args.expire_tiles_zoom_min,
        expire_output: args.expire_output.clone(),
    };
    opts.validate()?;
    Ok(opts)
}

fn run(args: &Args, opts: Options) -> Result<(), Box<dyn Error>> {
    let middle: Box<dyn Middle> = if opts.slim {
        Box::new(PgMiddle::new(&opts)?)
    } else {
        Box::new(RamMiddle::new(opts.scale))
    };

    let copy_thread = std::sync::Arc::new(copy::CopyThread::new(&opts.conninfo));
    let output: Box<dyn Output> = Box::new(PgsqlOutput::new(&opts, &copy_thread)?);

    let mut data = Osmdata::new(middle, vec![output], opts.clone());
    data.start()?;

    let filename = args.input.to_string_lossy();
    {
        let mut handler = InputHandler::new(&mut data, opts.append);
        if filename.ends_with(".osc") || filename.ends_with(".osc.gz") {
            osc::read_osc(&args.input, &mut handler)?;
        } else {
            pbf::read_pbf(&args.input, &mut handler)?;
        }
    }

    data.finish()?;
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let opts = match build_options(&args) {
        Ok(opts) => opts,
        Err(e) => return error_exit(&e.to_string()),
    };

    match run(&args, opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => error_exit(&e.to_string()),
    }
}
