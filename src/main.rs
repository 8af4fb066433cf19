mod cli;

use crate::cli::app::App;
use std::error::Error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let app = App::from_args();
    app.run().await?;
    Ok(())
}
