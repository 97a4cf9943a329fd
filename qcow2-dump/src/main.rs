use std::env;
use std::fs::{File, OpenOptions};

use qcow2::{FeatureGroup, Header, HeaderExtension};

mod format;

const COMMANDS: &str = "\
Commands:
  dump-header
  dump-header-exts
  set-header <field> <value>
  add-header-ext <magic> <data>
  del-header-ext <magic>
  set-feature-bit <incompatible|compatible|autoclear> <bit>";

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 3 {
        eprintln!("Usage: {} <image> <command> [args...]", args[0]);
        eprintln!("{COMMANDS}");
        std::process::exit(1);
    }

    let image_path = &args[1];
    match (args[2].as_str(), &args[3..]) {
        ("dump-header", []) => {
            let header = qcow2::parse(&mut File::open(image_path)?)?;
            print!("{}", format::header(&header));
            println!();
            print!("{}", format::extensions(&header));
        }
        ("dump-header-exts", []) => {
            let header = qcow2::parse(&mut File::open(image_path)?)?;
            print!("{}", format::extensions(&header));
        }
        ("set-header", [field, value]) => {
            let value = parse_int(value)?;
            modify(image_path, |header| Ok(header.set_field(field, value)?))?;
        }
        ("add-header-ext", [magic, data]) => {
            let magic = u32::try_from(parse_int(magic)?)?;
            let ext = HeaderExtension::create(magic, data.as_bytes())?;
            modify(image_path, |header| {
                header.add_extension(ext);
                Ok(())
            })?;
        }
        ("del-header-ext", [magic]) => {
            let magic = u32::try_from(parse_int(magic)?)?;
            modify(image_path, |header| {
                if header.remove_extensions(magic) == 0 {
                    anyhow::bail!("No such header extension: {magic:#x}");
                }
                Ok(())
            })?;
        }
        ("set-feature-bit", [group, bit]) => {
            let group = match group.as_str() {
                "incompatible" => FeatureGroup::Incompatible,
                "compatible" => FeatureGroup::Compatible,
                "autoclear" => FeatureGroup::Autoclear,
                other => anyhow::bail!("Unknown feature group: {other}"),
            };
            let bit = u32::try_from(parse_int(bit)?)?;
            modify(image_path, |header| Ok(header.set_feature_bit(group, bit)?))?;
        }
        (command, _) => {
            anyhow::bail!("Unknown command or wrong number of arguments: {command}\n{COMMANDS}")
        }
    }

    Ok(())
}

/// Parses the header, applies `f` and writes the header back in place.
fn modify(
    image_path: &str,
    f: impl FnOnce(&mut Header) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(image_path)?;
    let mut header = qcow2::parse(&mut file)?;
    f(&mut header)?;
    header.update(&mut file)?;
    Ok(())
}

/// Decimal, or hexadecimal with a `0x` prefix.
fn parse_int(s: &str) -> anyhow::Result<u64> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => Ok(u64::from_str_radix(hex, 16)?),
        None => Ok(s.parse()?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_decimal_and_hex() {
        assert_eq!(parse_int("42").unwrap(), 42);
        assert_eq!(parse_int("0x23852875").unwrap(), 0x23852875);
        assert!(parse_int("0xzz").is_err());
        assert!(parse_int("-1").is_err());
    }

    #[test]
    fn modify_rewrites_image_in_place() {
        let mut image = tempfile::NamedTempFile::new().unwrap();
        let mut header = Header::new(3, 16, 1 << 30);
        header.update(image.as_file_mut()).unwrap();
        image.as_file_mut().flush().unwrap();
        let path = image.path().to_str().unwrap().to_owned();

        modify(&path, |h| {
            h.add_extension(HeaderExtension::create(0x1234, b"note".to_vec())?);
            h.set_feature_bit(FeatureGroup::Autoclear, 1)?;
            Ok(())
        })
        .unwrap();

        let parsed = qcow2::parse(&mut File::open(&path).unwrap()).unwrap();
        assert_eq!(parsed.autoclear_features, 2);
        assert_eq!(parsed.extensions.len(), 1);
        assert_eq!(parsed.extensions[0].payload(), b"note");

        let err = modify(&path, |h| {
            if h.remove_extensions(0x9999) == 0 {
                anyhow::bail!("No such header extension");
            }
            Ok(())
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "No such header extension");
    }
}
