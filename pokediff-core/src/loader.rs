use std::future::Future;

use anyhow::Result;

use crate::{ModelSource, Pipeline, PipelineOptions};

pub trait Loader {
    type Pipeline: Pipeline;

    fn load(
        source: ModelSource,
        options: PipelineOptions,
    ) -> impl Future<Output = Result<Self::Pipeline>>
    where
        Self: Sized;
}
