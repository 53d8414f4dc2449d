//! Fixel-based analysis using connectivity-based fixel enhancement and
//! non-parametric permutation testing

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array1, Array2};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fixelcfe::connectivity::{build_connectivity, normalise, NormaliseOptions};
use fixelcfe::error::{FixelError, FixelResult};
use fixelcfe::fixel::{copy_index_and_directions, FixelAtlas};
use fixelcfe::mif::{identity_transform, Datatype, MifImage};
use fixelcfe::smooth::smooth_subject;
use fixelcfe::stats::cfe::Enhancer;
use fixelcfe::stats::glm::{all_stats, canonicalise_contrasts, identity_permutation, GlmTest};
use fixelcfe::stats::permute::{
    default_permutation, empirical_statistic, generate_permutations, load_permutations_file,
    run_permutations, statistic2pvalue,
};
use fixelcfe::tracks::TrackReader;

const DEFAULT_CFE_DH: f64 = 0.1;
const DEFAULT_CFE_E: f64 = 2.0;
const DEFAULT_CFE_H: f64 = 3.0;
const DEFAULT_CFE_C: f64 = 0.5;
const DEFAULT_ANGLE_THRESHOLD: f64 = 45.0;
const DEFAULT_CONNECTIVITY_THRESHOLD: f64 = 0.01;
const DEFAULT_SMOOTHING_FWHM: f64 = 10.0;
const DEFAULT_NUMBER_PERMUTATIONS: usize = 5000;

/// Fixel-based analysis using connectivity-based fixel enhancement and
/// non-parametric permutation testing
#[derive(Parser, Debug)]
#[command(name = "fixelcfe", version)]
struct Args {
    /// The fixel directory containing the template (index + directions)
    in_fixel_directory: PathBuf,

    /// Text file listing the subject fixel data files, one per line, in the
    /// same order as the rows of the design matrix
    subjects: PathBuf,

    /// The design matrix (whitespace-delimited text)
    design: PathBuf,

    /// The contrast matrix, specified as rows of weights
    contrast: PathBuf,

    /// The tracks used to determine fixel-fixel connectivity
    tracks: PathBuf,

    /// The output directory; created if it does not exist
    out_fixel_directory: PathBuf,

    /// Number of permutations
    #[arg(long, default_value_t = DEFAULT_NUMBER_PERMUTATIONS)]
    nperms: usize,

    /// Load permutation vectors from a text file instead of generating them
    #[arg(long)]
    permutations: Option<PathBuf>,

    /// Height increment used in the CFE integration (0.001 - 1.0)
    #[arg(long = "cfe_dh", default_value_t = DEFAULT_CFE_DH)]
    cfe_dh: f64,

    /// CFE extent exponent (0 - 100)
    #[arg(long = "cfe_e", default_value_t = DEFAULT_CFE_E)]
    cfe_e: f64,

    /// CFE height exponent (0 - 100)
    #[arg(long = "cfe_h", default_value_t = DEFAULT_CFE_H)]
    cfe_h: f64,

    /// CFE connectivity exponent (0 - 100)
    #[arg(long = "cfe_c", default_value_t = DEFAULT_CFE_C)]
    cfe_c: f64,

    /// Smoothing kernel FWHM in mm (0 - 200); 0 disables smoothing
    #[arg(long, default_value_t = DEFAULT_SMOOTHING_FWHM)]
    smooth: f64,

    /// Fraction of shared connections required for an edge to survive (0 - 1)
    #[arg(long, default_value_t = DEFAULT_CONNECTIVITY_THRESHOLD)]
    connectivity: f64,

    /// Maximum angle between a streamline tangent and a fixel direction,
    /// in degrees (0 - 90)
    #[arg(long, default_value_t = DEFAULT_ANGLE_THRESHOLD)]
    angle: f64,

    /// Add an element-wise design matrix column: a text file listing one
    /// fixel data file per subject (repeatable)
    #[arg(long = "column")]
    columns: Vec<PathBuf>,

    /// Perform non-stationarity adjustment of the enhanced statistics
    #[arg(long)]
    nonstationary: bool,

    /// Number of permutations for the non-stationarity pre-pass
    #[arg(long = "nperms_nonstationary", default_value_t = DEFAULT_NUMBER_PERMUTATIONS)]
    nperms_nonstationary: usize,

    /// Load non-stationarity pre-pass permutations from a text file
    #[arg(long = "permutations_nonstationary")]
    permutations_nonstationary: Option<PathBuf>,

    /// Skip permutation testing; only the observed statistics are written
    #[arg(long)]
    notest: bool,

    /// Worker pool size (default: available parallelism)
    #[arg(long)]
    threads: Option<usize>,
}

fn check_range(name: &str, value: f64, low: f64, high: f64) -> FixelResult<()> {
    if !(value >= low && value <= high) {
        return Err(FixelError::InputInvalid(format!(
            "option {} must lie in [{}, {}], got {}",
            name, low, high, value
        )));
    }
    Ok(())
}

fn progress_bar(length: u64, message: &'static str) -> ProgressBar {
    let bar = ProgressBar::new(length);
    let style = ProgressStyle::default_bar()
        .template("{msg} [{bar:40.cyan/blue}] {pos}/{len}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style.progress_chars("=> "));
    bar.set_message(message);
    bar
}

/// Parse a whitespace-delimited numeric matrix
fn load_matrix(path: &Path) -> FixelResult<Array2<f64>> {
    let text = fs::read_to_string(path).map_err(|e| FixelError::io(path, e))?;
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for (line_number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row: Vec<f64> = line
            .split_whitespace()
            .map(|v| {
                if v.eq_ignore_ascii_case("nan") {
                    Ok(f64::NAN)
                } else {
                    v.parse::<f64>().map_err(|_| {
                        FixelError::InputInvalid(format!(
                            "{}: malformed value \"{}\" on line {}",
                            path.display(),
                            v,
                            line_number + 1
                        ))
                    })
                }
            })
            .collect::<FixelResult<_>>()?;
        if let Some(first) = rows.first() {
            if row.len() != first.len() {
                return Err(FixelError::InputInvalid(format!(
                    "{}: inconsistent row length on line {}",
                    path.display(),
                    line_number + 1
                )));
            }
        }
        rows.push(row);
    }
    if rows.is_empty() {
        return Err(FixelError::InputInvalid(format!(
            "{}: empty matrix",
            path.display()
        )));
    }
    let ncols = rows[0].len();
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    let nrows = flat.len() / ncols;
    Array2::from_shape_vec((nrows, ncols), flat)
        .map_err(|e| FixelError::InputInvalid(format!("{}: {}", path.display(), e)))
}

/// Read a subject list: one fixel data file per line, resolved against the
/// input fixel directory when not found as given
fn load_file_list(path: &Path, fixel_directory: &Path) -> FixelResult<Vec<PathBuf>> {
    let text = fs::read_to_string(path).map_err(|e| FixelError::io(path, e))?;
    let mut files = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let direct = PathBuf::from(line);
        let resolved = if direct.is_file() {
            direct
        } else {
            fixel_directory.join(line)
        };
        if !resolved.is_file() {
            return Err(FixelError::InputInvalid(format!(
                "{}: file \"{}\" not found",
                path.display(),
                line
            )));
        }
        files.push(resolved);
    }
    if files.is_empty() {
        return Err(FixelError::InputInvalid(format!(
            "{}: no files listed",
            path.display()
        )));
    }
    Ok(files)
}

/// Load one fixel data file and check it holds exactly `num_fixels` values
fn load_fixel_data(path: &Path, num_fixels: usize) -> FixelResult<Vec<f64>> {
    let image = MifImage::load(path)?;
    let extra: usize = image.dim.iter().skip(1).product();
    if image.dim[0] != num_fixels || extra != 1 {
        return Err(FixelError::InputInvalid(format!(
            "fixel data file \"{}\" does not match template fixel image (dimensions {:?}, expected {} x 1)",
            path.display(),
            image.dim,
            num_fixels
        )));
    }
    Ok(image.data)
}

/// Load a cohort of per-subject fixel data files into an N x S matrix
fn load_cohort(files: &[PathBuf], num_fixels: usize) -> FixelResult<Array2<f64>> {
    let mut data = Array2::zeros((num_fixels, files.len()));
    for (subject, file) in files.iter().enumerate() {
        let values = load_fixel_data(file, num_fixels)?;
        data.column_mut(subject)
            .assign(&Array1::from_vec(values));
    }
    Ok(data)
}

/// Write one per-fixel map as a Float32 .mif file
fn write_fixel_output(
    directory: &Path,
    name: &str,
    values: &[f64],
    keyval: &[(String, String)],
) -> FixelResult<()> {
    let image = MifImage {
        dim: vec![values.len(), 1, 1],
        vox: vec![1.0, 1.0, 1.0],
        transform: identity_transform(),
        datatype: Datatype::Float32LE,
        keyval: keyval.to_vec(),
        data: values.to_vec(),
    };
    image.save(&directory.join(name))
}

/// Write a permutation distribution row as one value per line
fn save_vector(path: &Path, values: &[f64]) -> FixelResult<()> {
    let text: String = values
        .iter()
        .map(|v| format!("{}\n", v))
        .collect();
    fs::write(path, text).map_err(|e| FixelError::io(path, e))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> FixelResult<()> {
    check_range("--cfe_dh", args.cfe_dh, 0.001, 1.0)?;
    check_range("--cfe_e", args.cfe_e, 0.0, 100.0)?;
    check_range("--cfe_h", args.cfe_h, 0.0, 100.0)?;
    check_range("--cfe_c", args.cfe_c, 0.0, 100.0)?;
    check_range("--smooth", args.smooth, 0.0, 200.0)?;
    check_range("--connectivity", args.connectivity, 0.0, 1.0)?;
    check_range("--angle", args.angle, 0.0, 90.0)?;

    let threads = args.threads.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    });

    // Template atlas
    let atlas = FixelAtlas::load(&args.in_fixel_directory)?;
    let num_fixels = atlas.num_fixels();
    info!("number of fixels: {}", num_fixels);

    copy_index_and_directions(&args.in_fixel_directory, &args.out_fixel_directory)?;

    // Subjects and matrices
    let subject_files = load_file_list(&args.subjects, &args.in_fixel_directory)?;
    info!("number of subjects: {}", subject_files.len());

    // Validate every subject file against the template before any heavy
    // computation; the data is smoothed once the smoothing weights exist
    let bar = progress_bar(subject_files.len() as u64, "loading input images");
    let mut raw_data: Vec<Vec<f64>> = Vec::with_capacity(subject_files.len());
    for file in &subject_files {
        raw_data.push(load_fixel_data(file, num_fixels)?);
        bar.inc(1);
    }
    bar.finish();

    let design = load_matrix(&args.design)?;
    info!(
        "design matrix dimensions: {} x {}",
        design.nrows(),
        design.ncols()
    );
    if design.nrows() != subject_files.len() {
        return Err(FixelError::InputInvalid(format!(
            "number of input files ({}) does not match number of rows in design matrix ({})",
            subject_files.len(),
            design.nrows()
        )));
    }

    let contrast_raw = load_matrix(&args.contrast)?;

    // Element-wise design matrix columns
    let mut extra_columns: Vec<Array2<f64>> = Vec::new();
    let mut nans_in_columns = false;
    for column_path in &args.columns {
        let files = load_file_list(column_path, &args.in_fixel_directory)?;
        if files.len() != subject_files.len() {
            return Err(FixelError::InputInvalid(format!(
                "element-wise column \"{}\" lists {} files, expected {}",
                column_path.display(),
                files.len(),
                subject_files.len()
            )));
        }
        let column = load_cohort(&files, num_fixels)?;
        if column.iter().any(|v| !v.is_finite()) {
            nans_in_columns = true;
        }
        extra_columns.push(column);
    }
    if !extra_columns.is_empty() {
        info!(
            "number of element-wise design matrix columns: {}",
            extra_columns.len()
        );
        if nans_in_columns {
            info!("non-finite values detected in element-wise design matrix columns; individual rows will be removed from fixel-wise design matrices accordingly");
        }
    }

    let design_width = design.ncols() + extra_columns.len();
    let contrasts = canonicalise_contrasts(&contrast_raw, design_width)?;
    let num_contrasts = contrasts.nrows();
    let postfix = |i: usize| -> String {
        if num_contrasts > 1 {
            format!("_{}", i)
        } else {
            String::new()
        }
    };

    // Permutation vectors, when supplied
    let mut num_perms = args.nperms;
    let loaded_permutations = match &args.permutations {
        Some(path) => {
            let permutations = load_permutations_file(path)?;
            if permutations[0].len() != design.nrows() {
                return Err(FixelError::InputInvalid(format!(
                    "number of columns in the permutations file ({}) does not match number of rows in design matrix ({})",
                    permutations[0].len(),
                    design.nrows()
                )));
            }
            num_perms = permutations.len();
            Some(permutations)
        }
        None => None,
    };
    let loaded_permutations_nonstationary = match &args.permutations_nonstationary {
        Some(path) if args.nonstationary => {
            let permutations = load_permutations_file(path)?;
            if permutations[0].len() != design.nrows() {
                return Err(FixelError::InputInvalid(format!(
                    "number of columns in the nonstationary permutations file ({}) does not match number of rows in design matrix ({})",
                    permutations[0].len(),
                    design.nrows()
                )));
            }
            Some(permutations)
        }
        Some(_) => {
            warn!("--permutations_nonstationary option ignored: nonstationarity correction is not being performed (--nonstationary option)");
            None
        }
        None => None,
    };

    // Fixel-fixel connectivity from the track file
    let track_reader = TrackReader::open(&args.tracks)?;
    let num_tracks = track_reader.header_count().unwrap_or(0);
    if num_tracks == 0 {
        return Err(FixelError::InputInvalid(
            "no tracks found in input file".to_string(),
        ));
    }
    if num_tracks < 1_000_000 {
        warn!(
            "more than 1 million tracks is preferable to ensure robust fixel-fixel connectivity; file \"{}\" contains only {}",
            args.tracks.display(),
            num_tracks
        );
    }
    let bar = progress_bar(num_tracks as u64, "pre-computing fixel-fixel connectivity");
    let build = build_connectivity(&atlas, track_reader, atlas.vox(), args.angle, threads, || {
        bar.inc(1)
    })?;
    bar.finish();

    // Normalise, threshold and pre-exponentiate; derive smoothing weights
    let bar = progress_bar(
        num_fixels as u64,
        "normalising and thresholding fixel-fixel connectivity matrix",
    );
    let (graph, smoothing_weights) = normalise(
        build,
        &atlas,
        &NormaliseOptions {
            connectivity_threshold: args.connectivity,
            smooth_fwhm: args.smooth,
            cfe_c: args.cfe_c,
        },
        || bar.inc(1),
    );
    bar.finish();

    // Smooth the subject data along the connectivity graph
    let bar = progress_bar(subject_files.len() as u64, "smoothing input images");
    let mut data = Array2::zeros((num_fixels, subject_files.len()));
    let mut nans_in_data = false;
    for (subject, values) in raw_data.iter().enumerate() {
        let smoothed = smooth_subject(values, &smoothing_weights);
        if smoothed.iter().any(|v| !v.is_finite()) {
            nans_in_data = true;
        }
        data.column_mut(subject)
            .assign(&Array1::from_vec(smoothed));
        bar.inc(1);
    }
    bar.finish();
    drop(raw_data);
    if nans_in_data {
        info!("non-finite values present in data; rows will be removed from fixel-wise design matrices accordingly");
        if extra_columns.is_empty() {
            info!("(note that this will result in slower execution than if such values were not present)");
        }
    }

    // Output header metadata carried on every result image
    let keyval: Vec<(String, String)> = vec![
        ("num permutations".to_string(), num_perms.to_string()),
        ("dh".to_string(), args.cfe_dh.to_string()),
        ("cfe_e".to_string(), args.cfe_e.to_string()),
        ("cfe_h".to_string(), args.cfe_h.to_string()),
        ("cfe_c".to_string(), args.cfe_c.to_string()),
        ("angular threshold".to_string(), args.angle.to_string()),
        (
            "connectivity threshold".to_string(),
            args.connectivity.to_string(),
        ),
        ("smoothing FWHM".to_string(), args.smooth.to_string()),
        (
            "nonstationary adjustment".to_string(),
            args.nonstationary.to_string(),
        ),
    ];

    // Statistical engine
    let glm = GlmTest::new(data.clone(), design.clone(), &contrast_raw, extra_columns)?;

    // Identity-permutation reports: betas, effect sizes, standard deviation
    write_default_reports(
        args,
        &glm,
        &data,
        &design,
        &contrasts,
        threads,
        &keyval,
        &postfix,
    )?;

    let enhancer = Enhancer::new(&graph, args.cfe_dh, args.cfe_e, args.cfe_h);

    // Non-stationarity pre-pass
    let empirical = if args.nonstationary {
        let permutations = match loaded_permutations_nonstationary {
            Some(p) => p,
            None => {
                let mut rng = rand::thread_rng();
                generate_permutations(args.nperms_nonstationary, design.nrows(), false, &mut rng)?
            }
        };
        let bar = progress_bar(
            permutations.len() as u64,
            "pre-computing empirical statistic for non-stationarity adjustment",
        );
        let empirical = empirical_statistic(&permutations, &glm, &enhancer, threads, || bar.inc(1));
        bar.finish();
        for i in 0..num_contrasts {
            write_fixel_output(
                &args.out_fixel_directory,
                &format!("cfe_empirical{}.mif", postfix(i)),
                &empirical.row(i).to_vec(),
                &keyval,
            )?;
        }
        Some(empirical)
    } else {
        None
    };

    // Observed statistics
    let (observed_cfe, observed_tvalues) = default_permutation(&glm, &enhancer, empirical.as_ref());
    for i in 0..num_contrasts {
        write_fixel_output(
            &args.out_fixel_directory,
            &format!("cfe{}.mif", postfix(i)),
            &observed_cfe.row(i).to_vec(),
            &keyval,
        )?;
        write_fixel_output(
            &args.out_fixel_directory,
            &format!("tvalue{}.mif", postfix(i)),
            &observed_tvalues.row(i).to_vec(),
            &keyval,
        )?;
    }

    // Permutation testing
    if !args.notest {
        let permutations = match loaded_permutations {
            Some(p) => p,
            None => {
                let mut rng = rand::thread_rng();
                generate_permutations(num_perms, design.nrows(), true, &mut rng)?
            }
        };
        let bar = progress_bar(permutations.len() as u64, "running permutations");
        let result = run_permutations(
            &permutations,
            &glm,
            &enhancer,
            empirical.as_ref(),
            &observed_cfe,
            threads,
            || bar.inc(1),
        );
        bar.finish();

        for i in 0..num_contrasts {
            let distribution = result.distribution.row(i).to_vec();
            save_vector(
                &args
                    .out_fixel_directory
                    .join(format!("perm_dist{}.txt", postfix(i))),
                &distribution,
            )?;
            let fwe = statistic2pvalue(&distribution, &observed_cfe.row(i).to_vec());
            write_fixel_output(
                &args.out_fixel_directory,
                &format!("fwe_pvalue{}.mif", postfix(i)),
                &fwe,
                &keyval,
            )?;
            write_fixel_output(
                &args.out_fixel_directory,
                &format!("uncorrected_pvalue{}.mif", postfix(i)),
                &result.uncorrected_pvalues.row(i).to_vec(),
                &keyval,
            )?;
        }
    }

    info!("output written to {}", args.out_fixel_directory.display());
    Ok(())
}

/// Write beta coefficients, effect sizes and standard deviation for the
/// identity permutation. With element-wise columns (or NaN data) each fixel
/// owns its design matrix, so the report runs per fixel over a worker pool.
#[allow(clippy::too_many_arguments)]
fn write_default_reports(
    args: &Args,
    glm: &GlmTest,
    data: &Array2<f64>,
    design: &Array2<f64>,
    contrasts: &Array2<f64>,
    threads: usize,
    keyval: &[(String, String)],
    postfix: &dyn Fn(usize) -> String,
) -> FixelResult<()> {
    let num_fixels = data.nrows();
    let num_contrasts = contrasts.nrows();
    let width = contrasts.ncols();

    let (betas, abs_effect, std_effect, stdev) = match glm.as_variable() {
        Some(variable) => {
            let bar = progress_bar(
                num_fixels as u64,
                "calculating basic properties of default permutation",
            );
            let identity = identity_permutation(design.nrows());
            let cursor = AtomicUsize::new(0);
            let merged = Mutex::new((
                Array2::<f64>::zeros((width, num_fixels)),
                Array2::<f64>::zeros((num_contrasts, num_fixels)),
                Array2::<f64>::zeros((num_contrasts, num_fixels)),
                Array2::<f64>::zeros((num_contrasts, num_fixels)),
            ));

            std::thread::scope(|scope| {
                for _ in 0..threads.max(1) {
                    scope.spawn(|| {
                        let mut local_betas = Array2::<f64>::zeros((width, num_fixels));
                        let mut local_abs = Array2::<f64>::zeros((num_contrasts, num_fixels));
                        let mut local_std = Array2::<f64>::zeros((num_contrasts, num_fixels));
                        let mut local_stdev = Array2::<f64>::zeros((num_contrasts, num_fixels));
                        loop {
                            let fixel = cursor.fetch_add(1, Ordering::Relaxed);
                            if fixel >= num_fixels {
                                break;
                            }
                            let (fixel_design, values) =
                                variable.element_design(fixel, &identity);
                            if fixel_design.nrows() > 0 {
                                let measurements = values
                                    .into_shape((1, fixel_design.nrows()))
                                    .unwrap_or_else(|_| Array2::zeros((1, 0)));
                                let report = all_stats(&measurements, &fixel_design, contrasts);
                                local_betas
                                    .column_mut(fixel)
                                    .assign(&report.betas.column(0));
                                local_abs
                                    .column_mut(fixel)
                                    .assign(&report.abs_effect.column(0));
                                local_std
                                    .column_mut(fixel)
                                    .assign(&report.std_effect.column(0));
                                local_stdev
                                    .column_mut(fixel)
                                    .assign(&report.stdev.column(0));
                            }
                            bar.inc(1);
                        }
                        let mut merged = merged.lock().unwrap();
                        merged.0 += &local_betas;
                        merged.1 += &local_abs;
                        merged.2 += &local_std;
                        merged.3 += &local_stdev;
                    });
                }
            });
            bar.finish();
            let merged = merged.into_inner().unwrap_or_else(|e| e.into_inner());
            (merged.0, merged.1, merged.2, merged.3)
        }
        None => {
            let report = all_stats(data, design, contrasts);
            (
                report.betas,
                report.abs_effect,
                report.std_effect,
                report.stdev,
            )
        }
    };

    for k in 0..width {
        write_fixel_output(
            &args.out_fixel_directory,
            &format!("beta{}.mif", k),
            &betas.row(k).to_vec(),
            keyval,
        )?;
    }
    for i in 0..num_contrasts {
        write_fixel_output(
            &args.out_fixel_directory,
            &format!("abs_effect{}.mif", postfix(i)),
            &abs_effect.row(i).to_vec(),
            keyval,
        )?;
        write_fixel_output(
            &args.out_fixel_directory,
            &format!("std_effect{}.mif", postfix(i)),
            &std_effect.row(i).to_vec(),
            keyval,
        )?;
        write_fixel_output(
            &args.out_fixel_directory,
            &format!("std_dev{}.mif", postfix(i)),
            &stdev.row(i).to_vec(),
            keyval,
        )?;
    }
    Ok(())
}
