use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    ArgumentParse(#[from] clap::Error),
    #[error(transparent)]
    Config(#[from] keystage_engine::ConfigError),
    #[error(transparent)]
    Pipeline(#[from] keystage_engine::PipelineError),
    #[error(transparent)]
    Graph(#[from] keystage_engine::GraphError),
    #[error(transparent)]
    State(#[from] keystage_engine::StateError),
    #[error(transparent)]
    Workflow(#[from] keystage_engine::WorkflowError),
    #[error(transparent)]
    Report(#[from] keystage_report::ReportError),
    #[error("invalid log filter \"{filter}\"")]
    LogFilter {
        filter: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
}
