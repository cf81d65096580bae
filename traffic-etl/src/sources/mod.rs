pub mod csv_file;
pub mod synthetic;

pub use csv_file::CsvFileSource;
pub use synthetic::SyntheticTrafficSource;
