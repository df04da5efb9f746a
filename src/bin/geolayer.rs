use rusqlite_geolayer::{
    Crs, EngineConfig, LayerDb, LayerFilter, coordinate_transform, read_csv,
};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage:
  geolayer <config.toml> layers [<division> <role>]
  geolayer <config.toml> import <file.csv> <division> <layername> <layertype>
  geolayer <config.toml> repair
  geolayer <config.toml> utm2latlng <x> <y>";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run() {
        eprintln!("geolayer failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, command, rest) = match args.as_slice() {
        [config, command, rest @ ..] => (config, command.as_str(), rest),
        _ => return Err(USAGE.into()),
    };
    let config = EngineConfig::load_from(config_path)?;

    match (command, rest) {
        ("utm2latlng", [x, y]) => {
            let from = Crs::from_epsg(config.geometry.default_source_epsg)?;
            let (lng, lat) = coordinate_transform(x.parse()?, y.parse()?, from, Crs::Wgs84)?;
            println!("lat={lat} lng={lng}");
        }
        ("layers", rest) => {
            let filter = match rest {
                [] => LayerFilter::All,
                [division, role] => LayerFilter::for_role(role, division),
                _ => return Err(USAGE.into()),
            };
            let db = LayerDb::open(config)?;
            for layer in db.list_layers(&filter)? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    layer.formid, layer.division, layer.layertype, layer.layername, layer.created_at
                );
            }
        }
        ("import", [file, division, layername, layertype]) => {
            let rows = read_csv(std::fs::File::open(file)?)?;
            let db = LayerDb::open(config)?;
            let report = db.import_table(division, layername, layertype, &rows)?;
            println!(
                "{}: inserted {}, failed {}",
                report.formid, report.inserted, report.failed
            );
        }
        ("repair", []) => {
            let db = LayerDb::open(config)?;
            for table in db.drop_orphan_tables()? {
                println!("dropped orphan table {table}");
            }
            for report in db.repair_all()? {
                if report.table_created {
                    println!("{}: table recreated", report.formid);
                }
                for col_id in &report.columns_added {
                    println!("{}: added column {col_id}", report.formid);
                }
                for col_id in &report.unexpected {
                    println!("{}: column {col_id} is not in the catalog", report.formid);
                }
            }
        }
        _ => return Err(USAGE.into()),
    }

    Ok(())
}
