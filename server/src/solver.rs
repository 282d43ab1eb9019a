//! Plate Solver Adapter (spec.md §4.3). Spawns an external astrometric
//! solver once per solve (not a long-lived server the way the teacher's
//! `Tetra3Subprocess` manages its solver — §4.3 names a one-shot
//! invocation per call), pumps its stdout/stderr to the log the same way
//! `tetra3_subprocess.rs` does, and parses the `.ini`/`.wcs` side-car it
//! leaves behind.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use canonical_error::{failed_precondition_error, CanonicalError};
use tracing::{info, warn};

#[derive(Clone, Debug, Default)]
pub struct SolveResult {
    pub error: i32,
    pub ra: f64,
    pub dec: f64,
    pub orientation: f64,
}

pub struct SolverConfig {
    pub executable: PathBuf,
    pub catalog_path: PathBuf,
    pub max_stars: u32,
    pub downsample: u32,
    /// Remove the FITS and side-car files after solving unless true.
    pub debug_keep_temp_files: bool,
}

/// `solve(fitsPath, raHint, decHint, radiusDeg)` (spec.md §4.3). On
/// success, `ra`/`dec` are the solved coordinates (hours/degrees); on
/// failure, they equal the hints passed in and `error != 0`.
pub fn solve(
    config: &SolverConfig,
    fits_path: &Path,
    ra_hint: Option<f64>,
    dec_hint: f64,
    radius_deg: f64,
) -> Result<SolveResult, CanonicalError> {
    let mut cmd = Command::new(&config.executable);
    cmd.arg("-f").arg(fits_path)
        .arg("-r").arg(radius_deg.to_string())
        .arg("-s").arg(config.max_stars.to_string())
        .arg("-z").arg(config.downsample.to_string())
        .arg("-d").arg(&config.catalog_path)
        .arg("-update");
    if let Some(ra) = ra_hint {
        cmd.arg("-ra").arg(ra.to_string());
        cmd.arg(format!("-spd={}", dec_hint + 90.0));
    }
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| failed_precondition_error(&format!("spawning plate solver: {e}")))?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let stdout_thread = std::thread::spawn(move || pump_lines(stdout, false));
    let stderr_thread = std::thread::spawn(move || pump_lines(stderr, true));

    let status = child
        .wait()
        .map_err(|e| failed_precondition_error(&format!("waiting on plate solver: {e}")))?;
    let _ = stdout_thread.join();
    let _ = stderr_thread.join();

    let side_car = fits_path.with_extension("ini");
    let result = if status.success() {
        match parse_ini_side_car(&side_car) {
            Some((ra_deg, dec, orientation)) => SolveResult { error: 0, ra: ra_deg * 24.0 / 360.0, dec, orientation },
            None => SolveResult { error: 1, ra: ra_hint.unwrap_or(0.0), dec: dec_hint, orientation: 0.0 },
        }
    } else {
        SolveResult { error: 1, ra: ra_hint.unwrap_or(0.0), dec: dec_hint, orientation: 0.0 }
    };

    if !config.debug_keep_temp_files {
        let _ = std::fs::remove_file(&side_car);
    }
    Ok(result)
}

fn pump_lines(stream: impl std::io::Read, is_stderr: bool) {
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if is_stderr {
                    warn!("solver: {}", line.trim_end());
                } else {
                    info!("solver: {}", line.trim_end());
                }
            }
        }
    }
}

/// Parses `CRVAL1=`/`CRVAL2=`/`CROTA1=` out of a simple `key=value`
/// side-car file. `CRVAL1` stays in degrees here; the caller converts to
/// hours per §4.3.
fn parse_ini_side_car(path: &Path) -> Option<(f64, f64, f64)> {
    let contents = std::fs::read_to_string(path).ok()?;
    let mut crval1 = None;
    let mut crval2 = None;
    let mut crota1 = 0.0;
    for line in contents.lines() {
        let Some((key, value)) = line.split_once('=') else { continue };
        let key = key.trim();
        let Ok(value) = value.trim().parse::<f64>() else { continue };
        match key {
            "CRVAL1" => crval1 = Some(value),
            "CRVAL2" => crval2 = Some(value),
            "CROTA1" => crota1 = value,
            _ => {}
        }
    }
    Some((crval1?, crval2?, crota1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ini_side_car_extracts_known_keys() {
        let dir = std::env::temp_dir().join(format!("nightloop-solver-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("solution.ini");
        std::fs::write(&path, "CRVAL1=160.5\nCRVAL2=41.2\nCROTA1=3.1\nJUNK=abc\n").unwrap();
        let (ra, dec, rot) = parse_ini_side_car(&path).unwrap();
        assert_eq!(ra, 160.5);
        assert_eq!(dec, 41.2);
        assert_eq!(rot, 3.1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_parse_ini_side_car_missing_file_returns_none() {
        assert!(parse_ini_side_car(Path::new("/nonexistent/solution.ini")).is_none());
    }
}
