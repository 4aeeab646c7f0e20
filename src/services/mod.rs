pub mod comparator;
pub mod corpus;
pub mod detector;
pub mod dispatcher;
pub mod encryption;
pub mod enrollment;
pub mod lbph;
pub mod matching;
pub mod queue;
pub mod storage;
pub mod submission;
