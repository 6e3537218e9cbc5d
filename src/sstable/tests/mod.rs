mod helpers;
mod tests_compression;
