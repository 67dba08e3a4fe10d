fn main() {
    // Write build-time information (package version, features, git commit)
    // for `crate::build_info` to embed.
    built::write_built_file().expect("Failed to acquire build-time information");
}
