pub mod page_loader;

pub use page_loader::{
    build_tasks, page_number_of, scan_page_files, sort_page_files, DirectoryPageSource, PageSource,
};
