use quick_xml::events::attributes::AttrError;
use shared_utils::fsm::FsmError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DashClientError {
    #[error(transparent)]
    Xml(#[from] quick_xml::Error),

    #[error(transparent)]
    XmlAttribute(#[from] AttrError),

    #[error("invalid value for manifest attribute {attribute}: {value}")]
    InvalidAttribute { attribute: String, value: String },

    #[error("manifest has no video representation with a SegmentTemplate")]
    NoVideoRepresentation,

    #[error("unsupported segment template: {0}")]
    UnsupportedTemplate(String),

    #[error("invalid manifest url: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Request(#[from] reqwest::Error),

    #[error(transparent)]
    Fsm(#[from] FsmError),
}

pub type DashClientResult<T> = Result<T, DashClientError>;
