//! Run configuration
//!
//! A plain value built once from the command line and captured by the
//! components that need parts of it. There is no global state.

use std::path::PathBuf;
use thiserror::Error;

use crate::geom::SRID_MERC;
use crate::osm::BoundingBox;
use crate::projection::Reprojection;

/// Default fixed-point scale of the node caches: decimicro degrees.
pub const DEFAULT_SCALE: i32 = 10_000_000;

#[derive(Debug, Clone)]
pub struct Options {
    /// libpq-style connection string.
    pub conninfo: String,
    /// Apply a change file against an existing database.
    pub append: bool,
    /// Persist ways/relations in the database (required for append).
    pub slim: bool,
    /// Only import nodes inside this box (and objects using them).
    pub bbox: Option<BoundingBox>,
    /// Worker threads for the pending stages and parallel indexing.
    pub num_procs: usize,
    /// Drop the middle tables after the import instead of indexing them.
    pub droptemp: bool,
    /// Build indexes on several connections at once.
    pub parallel_indexing: bool,
    /// Also output objects without any tags.
    pub extra_attributes: bool,
    /// Reprocess parents of changed objects in append mode.
    pub with_forward_dependencies: bool,
    /// Node locations in a flat file instead of RAM or the database.
    pub flat_node_file: Option<PathBuf>,
    /// Fixed-point scale for cached node coordinates.
    pub scale: i32,
    /// RAM node cache size hint; 0 sends node locations to the
    /// database, which append mode needs when there is no flat file.
    pub cache_size_mb: usize,
    /// Schema for the middle tables; empty uses the default search path.
    pub middle_schema: String,
    /// Table name prefix.
    pub prefix: String,
    /// SRID of the output geometry columns.
    pub srid: i32,
    /// Tablespace for output tables; empty uses the default.
    pub tablespace_data: String,
    /// Tablespace for output indexes; empty uses the default.
    pub tablespace_index: String,
    /// Tile expiry zoom; None disables expiry tracking.
    pub expire_tiles_zoom: Option<u32>,
    /// Lowest zoom written to the expiry file.
    pub expire_tiles_zoom_min: u32,
    /// File the expiry list is appended to.
    pub expire_output: PathBuf,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            conninfo: String::new(),
            append: false,
            slim: false,
            bbox: None,
            num_procs: 1,
            droptemp: false,
            parallel_indexing: true,
            extra_attributes: false,
            with_forward_dependencies: true,
            flat_node_file: None,
            scale: DEFAULT_SCALE,
            cache_size_mb: 800,
            middle_schema: String::new(),
            prefix: String::from("planet_osm"),
            srid: SRID_MERC,
            tablespace_data: String::new(),
            tablespace_index: String::new(),
            expire_tiles_zoom: None,
            expire_tiles_zoom_min: 0,
            expire_output: PathBuf::from("dirty_tiles"),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("append mode requires --slim")]
    AppendNeedsSlim,
    #[error("append mode needs node locations that survive between runs: use --flat-nodes or --cache 0")]
    AppendNeedsNodeStore,
    #[error("--number-processes must be at least 1")]
    NoProcs,
    #[error("unsupported output SRID {0}, use 4326 or 3857")]
    BadSrid(i32),
    #[error("--scale must be positive")]
    BadScale,
    #[error("expiry minimum zoom {minzoom} is above the expiry zoom {zoom}")]
    BadExpireZoom { minzoom: u32, zoom: u32 },
}

impl Options {
    /// Check cross-flag consistency; errors abort before anything
    /// touches the database.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.append && !self.slim {
            return Err(ConfigError::AppendNeedsSlim);
        }
        if self.append && self.flat_node_file.is_none() && self.cache_size_mb > 0 {
            return Err(ConfigError::AppendNeedsNodeStore);
        }
        if self.num_procs < 1 {
            return Err(ConfigError::NoProcs);
        }
        if Reprojection::from_srid(self.srid).is_none() {
            return Err(ConfigError::BadSrid(self.srid));
        }
        if self.scale < 1 {
            return Err(ConfigError::BadScale);
        }
        if let Some(zoom) = self.expire_tiles_zoom {
            if self.expire_tiles_zoom_min > zoom {
                return Err(ConfigError::BadExpireZoom {
                    minzoom: self.expire_tiles_zoom_min,
                    zoom,
                });
            }
        }
        Ok(())
    }

    pub fn projection(&self) -> Reprojection {
        Reprojection::from_srid(self.srid).expect("validated srid")
    }
}
