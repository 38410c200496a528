//! Reference image management
//!
//! Every VM disk is a full copy of one reference image per catalog entry. The
//! image is built from install media the first time it is needed and reused
//! from then on; its presence on disk is the cache.

use crate::config::ImageCatalogEntry;
use crate::hyperv::shell::escape_ps;
use crate::hyperv::PowerShell;
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Converts install media into a bootable reference disk
#[cfg_attr(test, mockall::automock)]
pub trait ImageBuilder {
    fn build_image(&self, install_media: &Path, destination: &Path) -> Result<()>;
}

/// Delegates the conversion to an operator-supplied PowerShell script,
/// invoked as `& <script> -SourcePath <media> -VhdPath <destination>`.
pub struct ScriptImageBuilder {
    script: Option<PathBuf>,
    shell: PowerShell,
}

impl ScriptImageBuilder {
    pub fn new(script: Option<PathBuf>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            script,
            shell: PowerShell::new(timeout)?,
        })
    }
}

impl ImageBuilder for ScriptImageBuilder {
    fn build_image(&self, install_media: &Path, destination: &Path) -> Result<()> {
        let script = self.script.as_deref().ok_or_else(|| {
            Error::Configuration(
                "no imageBuilderScript configured; cannot build a reference image".into(),
            )
        })?;

        self.shell.run(&format!(
            "& '{}' -SourcePath '{}' -VhdPath '{}'",
            escape_ps(&script.to_string_lossy()),
            escape_ps(&install_media.to_string_lossy()),
            escape_ps(&destination.to_string_lossy())
        ))?;
        Ok(())
    }
}

/// Whether a reference image is ready or must be built first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    Cached,
    NeedsBuild,
}

impl std::fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageStatus::Cached => write!(f, "cached"),
            ImageStatus::NeedsBuild => write!(f, "build from install media"),
        }
    }
}

pub struct ReferenceImageBuilder {
    builder: Box<dyn ImageBuilder>,
}

impl ReferenceImageBuilder {
    pub fn new(builder: Box<dyn ImageBuilder>) -> Self {
        Self { builder }
    }

    /// Report what [`ensure_image`](Self::ensure_image) would do, without doing it
    pub fn status(&self, image: &ImageCatalogEntry) -> Result<ImageStatus> {
        if image.reference_image_path.exists() {
            return Ok(ImageStatus::Cached);
        }
        check_media(image)?;
        Ok(ImageStatus::NeedsBuild)
    }

    /// Path of the reference image, building it first if it does not exist
    pub fn ensure_image(&self, image: &ImageCatalogEntry) -> Result<PathBuf> {
        let destination = &image.reference_image_path;
        if destination.exists() {
            tracing::debug!(image = %image.image_name, path = %destination.display(), "Reference image present");
            return Ok(destination.clone());
        }
        check_media(image)?;

        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!(
            image = %image.image_name,
            media = %image.install_media_path.display(),
            "Building reference image"
        );
        self.builder
            .build_image(&image.install_media_path, destination)?;

        if !destination.exists() {
            return Err(Error::ImageBuild(format!(
                "builder finished but {} does not exist",
                destination.display()
            )));
        }
        tracing::info!(image = %image.image_name, path = %destination.display(), "Reference image built");
        Ok(destination.clone())
    }
}

fn check_media(image: &ImageCatalogEntry) -> Result<()> {
    if image.install_media_path.exists() {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "install media for image '{}' not found: {}",
            image.image_name,
            image.install_media_path.display()
        )))
    }
}
