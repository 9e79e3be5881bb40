//! Shared state of one export run.

use std::sync::Arc;

use crate::domain::ExportConfig;
use crate::infrastructure::{
    DataSource, DocumentRenderer, FileLimits, ImageConverter, ProcessFileLimits, SipsConverter,
    WeasyPrint,
};

/// Settings and collaborators shared, read-only, by every export task.
pub struct ExportContext {
    /// Export settings, with absolute paths.
    pub config: ExportConfig,
    pub source: Arc<dyn DataSource>,
    pub converter: Arc<dyn ImageConverter>,
    pub renderer: Arc<dyn DocumentRenderer>,
    pub limits: Arc<dyn FileLimits>,
}

impl ExportContext {
    /// Context using the system tools: `sips`, `weasyprint`, and the
    /// process open files limit.
    #[must_use]
    pub fn new(config: ExportConfig, source: Arc<dyn DataSource>) -> Self {
        Self {
            config,
            source,
            converter: Arc::new(SipsConverter::new()),
            renderer: Arc::new(WeasyPrint),
            limits: Arc::new(ProcessFileLimits::new()),
        }
    }

    #[must_use]
    pub fn with_converter(mut self, converter: Arc<dyn ImageConverter>) -> Self {
        self.converter = converter;
        self
    }

    #[must_use]
    pub fn with_renderer(mut self, renderer: Arc<dyn DocumentRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: Arc<dyn FileLimits>) -> Self {
        self.limits = limits;
        self
    }
}
