//! Writes a finished job's results to `{output}/{id}/` using parKVFinder's
//! file naming.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use toml::Value;

use crate::models::job::{JobRecord, JobStatus};
use crate::models::settings::{BoxDescriptor, Settings};
use crate::services::atomic::write_atomic;

const REPORT_HEADER: &str = "# TOML results file for parKVFinder software\n\n";
const LOG_JOB_LINE: &str = "Running parKVFinder for: ";
// Debug output of the detection engine's internal dictionary.
const LOG_DICTIONARY_MARKER: &str = "Dictionary: ";

/// Where a job's artifacts live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub dir: PathBuf,
    pub cavity: PathBuf,
    pub report: PathBuf,
    pub log: PathBuf,
    /// `None` for manually added jobs, whose settings are unknown.
    pub parameters: Option<PathBuf>,
}

impl ArtifactPaths {
    pub fn all(&self) -> impl Iterator<Item = &Path> {
        [Some(&self.cavity), Some(&self.report), Some(&self.log), self.parameters.as_ref()]
            .into_iter()
            .flatten()
            .map(PathBuf::as_path)
    }
}

/// Materializes result payloads as local files.
#[derive(Debug, Default, Clone)]
pub struct ResultExporter;

impl ResultExporter {
    pub fn new() -> Self {
        Self
    }

    pub fn artifact_paths(&self, record: &JobRecord) -> Result<ArtifactPaths, ExportError> {
        let id = record.id().ok_or(ExportError::MissingId)?;
        let base_name = record.base_name().unwrap_or(id);
        let dir = record.files.output.join(id);

        Ok(ArtifactPaths {
            cavity: dir.join(format!("{}.KVFinder.output.pdb", base_name)),
            report: dir.join(format!("{}.KVFinder.results.toml", base_name)),
            log: dir.join("KVFinder.log"),
            parameters: (!record.manually_added).then(|| dir.join(format!("{}_parameters.toml", base_name))),
            dir,
        })
    }

    /// True when every artifact of the record already exists on disk.
    pub fn is_exported(&self, record: &JobRecord) -> bool {
        self.artifact_paths(record)
            .map(|paths| paths.all().all(Path::is_file))
            .unwrap_or(false)
    }

    /// Writes all artifacts. Each file is replaced atomically, so running it
    /// again after a failure (or a success) is safe.
    pub fn export(&self, record: &JobRecord) -> Result<ArtifactPaths, ExportError> {
        let id = record.id().ok_or(ExportError::MissingId)?;
        if !record.status().has_results() {
            return Err(ExportError::NotReady {
                id: id.to_string(),
                status: record.status(),
            });
        }
        let payload = record
            .payload()
            .ok_or_else(|| ExportError::MissingPayload(id.to_string()))?;
        let paths = self.artifact_paths(record)?;

        // Render everything before touching the disk.
        let report = patch_report(id, &payload.output.report, record, &paths.cavity)?;
        let log = filter_log(&payload.output.log, id);
        let parameters = match &paths.parameters {
            Some(path) => {
                let settings = record
                    .settings
                    .as_ref()
                    .ok_or_else(|| ExportError::MissingSettings(id.to_string()))?;
                Some((path, render_parameters(record, settings)))
            }
            None => None,
        };

        fs::create_dir_all(&paths.dir)?;
        write_atomic(&paths.cavity, payload.output.pdb_kv.as_bytes())?;
        write_atomic(&paths.report, report.as_bytes())?;
        write_atomic(&paths.log, log.as_bytes())?;
        if let Some((path, text)) = parameters {
            write_atomic(path, text.as_bytes())?;
        }

        tracing::info!(job_id = %id, dir = %paths.dir.display(), "Exported job results");
        Ok(paths)
    }
}

/// Points the report's `[FILES_PATH]` entries at the local files.
fn patch_report(id: &str, report: &str, record: &JobRecord, cavity: &Path) -> Result<String, ExportError> {
    let report_error = |message: String| ExportError::Report {
        id: id.to_string(),
        message,
    };

    let mut table: toml::Table = report.parse().map_err(|e: toml::de::Error| report_error(e.to_string()))?;
    let files = table
        .get_mut("FILES_PATH")
        .and_then(Value::as_table_mut)
        .ok_or_else(|| report_error("missing [FILES_PATH] table".to_string()))?;

    set_path(files, "INPUT", record.files.pdb.as_deref());
    set_path(files, "LIGAND", record.files.ligand.as_deref());
    set_path(files, "OUTPUT", Some(cavity));

    let body = toml::to_string(&table).map_err(|e| report_error(e.to_string()))?;
    Ok(format!("{}{}", REPORT_HEADER, body))
}

fn set_path(table: &mut toml::Table, key: &str, path: Option<&Path>) {
    match path {
        Some(path) => {
            table.insert(key.to_string(), Value::String(path.display().to_string()));
        }
        None => {
            table.remove(key);
        }
    }
}

/// Replaces the remote job line with the local id and drops dictionary dumps.
fn filter_log(log: &str, id: &str) -> String {
    let mut out = String::with_capacity(log.len());
    for line in log.lines() {
        if line.contains(LOG_DICTIONARY_MARKER) {
            continue;
        }
        if line.contains(LOG_JOB_LINE) {
            let _ = writeln!(out, "Running parKVFinder for job ID: {}", id);
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Annotated TOML summary of the settings a job was submitted with.
fn render_parameters(record: &JobRecord, settings: &Settings) -> String {
    let mut out = String::new();
    out.push_str("# TOML configuration file for KVFinder-web job.\n\n");
    out.push_str("title = \"KVFinder-web parameters file\"\n\n");

    let path_value = |path: Option<&Path>| Value::String(path.map_or_else(|| "-".to_string(), |p| p.display().to_string()));
    section(
        &mut out,
        "files",
        None,
        &[
            ("The path of the input PDB file.", "pdb", path_value(record.files.pdb.as_deref())),
            ("The path for the ligand's PDB file.", "ligand", path_value(record.files.ligand.as_deref())),
        ],
    );

    out.push_str("[settings]\n# Settings for cavity detection.\n\n");

    let modes = &settings.modes;
    section(
        &mut out,
        "settings.modes",
        None,
        &[
            (
                "Whole protein mode defines the search space as the whole protein.",
                "whole_protein_mode",
                Value::Boolean(modes.whole_protein_mode),
            ),
            (
                "Box adjustment mode defines the search space as a box around a region of interest.",
                "box_mode",
                Value::Boolean(modes.box_mode),
            ),
            (
                "Resolution mode implicitly sets the grid spacing (Low, Medium or High).",
                "resolution_mode",
                Value::String(modes.resolution_mode.to_string()),
            ),
            (
                "Surface mode: true for the Solvent Excluded Surface, false for the Solvent Accessible Surface.",
                "surface_mode",
                Value::Boolean(modes.surface_mode),
            ),
            (
                "Cavity representation: true exports cavity boundaries, false exports filled cavities.",
                "kvp_mode",
                Value::Boolean(modes.kvp_mode),
            ),
            (
                "Ligand adjustment mode restricts cavities to the vicinity of the ligand.",
                "ligand_mode",
                Value::Boolean(modes.ligand_mode),
            ),
        ],
    );

    section(
        &mut out,
        "settings.step_size",
        None,
        &[(
            "Grid spacing in Angstroms, used when resolution mode is off.",
            "step_size",
            Value::Float(settings.step_size.step_size),
        )],
    );

    section(
        &mut out,
        "settings.probes",
        None,
        &[
            (
                "Probe In: radius of the small probe that defines the biomolecular surface (A).",
                "probe_in",
                Value::Float(settings.probes.probe_in),
            ),
            (
                "Probe Out: radius of the large probe that defines inaccessible regions (A).",
                "probe_out",
                Value::Float(settings.probes.probe_out),
            ),
        ],
    );

    section(
        &mut out,
        "settings.cutoffs",
        None,
        &[
            (
                "Cavities smaller than this volume are discarded (A3).",
                "volume_cutoff",
                Value::Float(settings.cutoffs.volume_cutoff),
            ),
            (
                "Cavity points farther than this distance from the ligand are discarded (A).",
                "ligand_cutoff",
                Value::Float(settings.cutoffs.ligand_cutoff),
            ),
            (
                "Length removed from the cavity-bulk frontier (A).",
                "removal_distance",
                Value::Float(settings.cutoffs.removal_distance),
            ),
        ],
    );

    box_sections(
        &mut out,
        "settings.visiblebox",
        "Vertices of the box shown to the user (A).",
        &settings.visiblebox,
    );
    box_sections(
        &mut out,
        "settings.internalbox",
        "Vertices of the box searched by parKVFinder, including the probe out margin (A).",
        &settings.internalbox,
    );

    out
}

fn box_sections(out: &mut String, name: &str, comment: &str, descriptor: &BoxDescriptor) {
    let points = [
        ("p1", &descriptor.p1),
        ("p2", &descriptor.p2),
        ("p3", &descriptor.p3),
        ("p4", &descriptor.p4),
    ];
    for (index, (label, point)) in points.into_iter().enumerate() {
        section(
            out,
            &format!("{}.{}", name, label),
            (index == 0).then_some(comment),
            &[
                ("", "x", Value::Float(point.x)),
                ("", "y", Value::Float(point.y)),
                ("", "z", Value::Float(point.z)),
            ],
        );
    }
}

fn section(out: &mut String, name: &str, comment: Option<&str>, entries: &[(&str, &str, Value)]) {
    if let Some(comment) = comment {
        let _ = writeln!(out, "# {}", comment);
    }
    let _ = writeln!(out, "[{}]", name);
    for (doc, key, value) in entries {
        if !doc.is_empty() {
            let _ = writeln!(out, "# {}", doc);
        }
        let _ = writeln!(out, "{} = {}", key, value);
    }
    out.push('\n');
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Job {id} is {status}; only completed or timed out jobs can be exported")]
    NotReady { id: String, status: JobStatus },

    #[error("Cannot export a job without an id")]
    MissingId,

    #[error("Job {0} has no result payload")]
    MissingPayload(String),

    #[error("Job {0} has no settings to describe")]
    MissingSettings(String),

    #[error("Malformed report for job {id}: {message}")]
    Report { id: String, message: String },

    #[error("Failed to write export artifact: {0}")]
    Io(#[from] io::Error),

    #[error("Export task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
