use std::path::Path;

use tracing::info;

/// Camera node probed when the source is `auto`
pub const DEFAULT_CAMERA: &str = "/dev/video0";
pub const TEST_SOURCE: &str = "videotestsrc is-live=true";

/// Turn the configured source into a GStreamer source description.
///
/// `auto` picks the first camera if present, otherwise the test source.
pub fn resolve_source(source: &str) -> String {
    resolve_source_with(source, Path::new(DEFAULT_CAMERA))
}

fn resolve_source_with(source: &str, camera: &Path) -> String {
    let source = source.trim();
    if source.is_empty() {
        return TEST_SOURCE.into();
    }
    if source != "auto" {
        return source.into();
    }

    if camera.exists() {
        info!("Found capture device: {}", camera.display());
        format!("v4l2src device={}", camera.display())
    } else {
        info!("No capture device at {}, using test source", camera.display());
        TEST_SOURCE.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_sources_pass_through() {
        assert_eq!(resolve_source("v4l2src device=/dev/video2"), "v4l2src device=/dev/video2");
        assert_eq!(resolve_source("  "), TEST_SOURCE);
    }

    #[test]
    fn auto_falls_back_without_camera() {
        let missing = Path::new("/nonexistent/video9");
        assert_eq!(resolve_source_with("auto", missing), TEST_SOURCE);
        let present = Path::new("/");
        assert_eq!(resolve_source_with("auto", present), "v4l2src device=/");
    }
}
