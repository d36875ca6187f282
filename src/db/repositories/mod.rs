pub mod scan_records;
