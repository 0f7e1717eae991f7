pub mod assembler;
pub mod dir_service;
pub mod id_service;
pub mod request_path;
pub mod request_writer;
pub mod tracker;
pub mod upload_service;

pub use assembler::Assembler;
pub use dir_service::DirService;
pub use id_service::{CreatedUpload, IdRequest, IdService};
pub use request_path::RequestPath;
pub use request_writer::{BlockRequestWriter, RequestWriter};
pub use tracker::{BlockSet, BlockTracker};
pub use upload_service::{ChunkRequest, UploadService, UploadStatus};
