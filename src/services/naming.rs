//! Destination naming for converted audio.
//!
//! The output of `dir/clip.wav` is `dir/clip_output.flac`. The suffix is also
//! how already-converted objects are recognised, so the two functions here
//! must stay in agreement.

/// Reserved suffix marking an object as converted mono audio.
pub const CONVERTED_SUFFIX: &str = "_output.flac";

/// Last path segment of an object name.
pub fn base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// True when the object's base name already carries the converted suffix.
pub fn is_converted(name: &str) -> bool {
    base_name(name).ends_with(CONVERTED_SUFFIX)
}

/// Compute the destination path for a converted object.
///
/// Keeps the directory, drops the final extension of the base name and
/// appends [`CONVERTED_SUFFIX`]. An extension is a trailing `.` followed by
/// at least one character that is neither `.` nor `/`.
pub fn derive_output_path(name: &str) -> String {
    let (dir, file) = match name.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, name),
    };

    let target = format!("{}{}", strip_extension(file), CONVERTED_SUFFIX);
    match dir {
        Some(dir) => format!("{}/{}", dir, target),
        None => target,
    }
}

fn strip_extension(file: &str) -> &str {
    match file.rfind('.') {
        Some(pos) if pos + 1 < file.len() => &file[..pos],
        _ => file,
    }
}
