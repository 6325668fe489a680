pub mod test_server;

/// Stand-in transcoder for pipeline tests: concatenates its `-i` inputs
/// into the output file. m3u8 inputs are expanded to the files they list,
/// which mimics HLS assembly closely enough to check the plumbing.
#[cfg(unix)]
#[allow(dead_code)]
pub fn fake_ffmpeg(dir: &std::path::Path) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("ffmpeg");
    let script = r#"#!/bin/sh
inputs=""
prev=""
out=""
for a in "$@"; do
  if [ "$prev" = "-i" ]; then inputs="$inputs $a"; fi
  prev="$a"
  out="$a"
done
: > "$out"
for f in $inputs; do
  case "$f" in
    *.m3u8)
      while IFS= read -r line; do
        case "$line" in
          \#*|"") ;;
          *) cat "$line" >> "$out" ;;
        esac
      done < "$f"
      ;;
    *) cat "$f" >> "$out" ;;
  esac
done
exit 0
"#;
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}
