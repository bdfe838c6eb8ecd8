mod handler;
mod path;

pub use handler::SftpSession;
pub use path::{clean, dir_size, PathTranslator};
