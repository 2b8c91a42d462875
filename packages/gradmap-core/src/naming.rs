use crate::descriptor::OutputFormat;
use std::path::Path;

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Output file name for mapping `gradient` over `input`.
///
/// `[prefix_]<input stem>_<gradient stem>[_suffix].<ext>`, reduced to its
/// final path component so a prefix or suffix can never point outside the
/// output directory. Identical inputs yield identical names; a later task
/// silently overwrites an earlier one.
pub fn output_file_name(
    input: &Path,
    gradient: &Path,
    prefix: Option<&str>,
    suffix: Option<&str>,
    format: OutputFormat,
) -> String {
    let mut name = format!("{}_{}", stem(input), stem(gradient));

    if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
        name = format!("{}_{}", prefix, name);
    }
    if let Some(suffix) = suffix.filter(|s| !s.is_empty()) {
        name = format!("{}_{}", name, suffix);
    }
    let name = format!("{}.{}", name, format.extension());

    Path::new(&name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or(name)
}
