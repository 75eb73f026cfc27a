// Compiling this test makes ts-rs export every `#[ts(export)]` type.
// Run with: cargo test -p siteline-models export_bindings
// Output goes to TS_RS_EXPORT_DIR, or ./bindings by default.

#[test]
fn export_typescript_bindings() {
    println!("TypeScript bindings exported");
}
