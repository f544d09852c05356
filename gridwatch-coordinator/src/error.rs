use gridwatch_core::TopologyError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("LM {id} sent an invalid topology: {source}")]
    InvalidTopology {
        id: Uuid,
        #[source]
        source: TopologyError,
    },
    #[error("need at least two LMs, {0} registered")]
    NotEnoughLms(usize),
    #[error("need one NM per LM ({lms} LMs), {nms} registered")]
    NotEnoughNms { lms: usize, nms: usize },
    #[error("coordinator is in the ERROR state")]
    Halted,
    #[error("monitor {0} is already registered with another role")]
    RoleConflict(Uuid),
}
