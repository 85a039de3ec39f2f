fn main() -> anyhow::Result<()> {
    amp_visibility_lib::run()
}
