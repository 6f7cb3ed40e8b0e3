fn main() -> Result<(), Box<dyn std::error::Error>> {
    chatpipe::cli::main()
}
