//! Sample inputs and service payloads for integration tests

/// Small protein fragment used as the submitted structure.
pub const PROTEIN_PDB: &str = "\
ATOM      1  N   MET A   1      27.340  24.430   2.614  1.00  9.67           N
ATOM      2  CA  MET A   1      26.266  25.413   2.842  1.00 10.38           C
ATOM      3  C   MET A   1      26.913  26.639   3.531  1.00  9.62           C
END
";

pub const LIGAND_PDB: &str = "\
HETATM    1  C1  LIG B   1      25.000  25.000   3.000  1.00  0.00           C
END
";

/// Cavity structure as returned in `output.pdb_kv`.
pub const CAVITY_PDB: &str = "\
ATOM      1  HS  KAA   259      26.000  24.800   2.400  1.00  0.00
ATOM      2  HA  KAA   259      26.600  24.800   2.400  1.00  0.00
";

/// parKVFinder results file as returned in `output.report`.
pub const REPORT_TOML: &str = "\
[FILES_PATH]
INPUT = \"/opt/kvfinder-web/jobs/42/protein.pdb\"
LIGAND = \"-\"
OUTPUT = \"/opt/kvfinder-web/jobs/42/KV_Files/protein.KVFinder.output.pdb\"

[PARAMETERS]
STEP = 0.6
RESOLUTION = \"Low\"

[RESULTS.VOLUME]
KAA = 137.16

[RESULTS.AREA]
KAA = 126.41
";

/// parKVFinder log as returned in `output.log`.
pub const RUN_LOG: &str = "\
==========\tSTART\tRUN\t=========

Date and time: Fri Mar  1 10:00:02 2024

Running parKVFinder for: /opt/kvfinder-web/jobs/42/protein.pdb
Dictionary: /opt/parKVFinder/dictionary
Probe In [Å]: 1.4
Probe Out [Å]: 4.0

Total time elapsed: 0.41 seconds
";
