use crate::common::{clamp_u8, degree_for_dim, dim_for_degree};
use crate::error::{EditError, EditResult};
use crate::structures::{GaussianPointSet, SceneSnapshot};
use foldhash::HashMap;
use foldhash::HashMapExt;
use std::io::Write;
use zerocopy::IntoBytes;

const MAX_SH_REST_FIELDS: usize = 45;

#[inline]
fn next_line<'b>(buffer: &'b [u8], offset: &mut usize) -> Option<&'b [u8]> {
    if *offset >= buffer.len() {
        return None;
    }
    let start = *offset;

    match memchr::memchr(b'\n', &buffer[*offset..]) {
        Some(pos) => {
            *offset = start + pos + 1;
            Some(trim_cr(&buffer[start..start + pos]))
        }
        None => {
            *offset = buffer.len();
            Some(trim_cr(&buffer[start..]))
        }
    }
}

#[inline]
fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[inline(always)]
fn idx_of(hm: &HashMap<&str, usize>, name: &str) -> EditResult<usize> {
    hm.get(name)
        .cloned()
        .ok_or_else(|| EditError::ParsePly(format!("Missing required field: {}", name)))
}

#[inline(always)]
fn read_f32(vertex: &[u8], field: usize) -> f32 {
    let at = field * 4;
    f32::from_le_bytes([vertex[at], vertex[at + 1], vertex[at + 2], vertex[at + 3]])
}

/// Parses a binary little-endian 3DGS PLY (all properties `float`).
pub fn parse_gaussian_ply(raw_data: &[u8]) -> EditResult<GaussianPointSet> {
    let mut offset = 0;

    let line1 = next_line(raw_data, &mut offset)
        .ok_or_else(|| EditError::ParsePly("No 'ply' line".to_string()))?;
    if line1 != b"ply" {
        return Err(EditError::ParsePly(
            "Not a .ply file (missing 'ply' header)".to_string(),
        ));
    }

    let mut num_points: Option<usize> = None;
    let mut field_names: Vec<&[u8]> = Vec::new();
    loop {
        let line = next_line(raw_data, &mut offset).ok_or_else(|| {
            EditError::ParsePly("No 'end_header' found before EOF".to_string())
        })?;

        if line.starts_with(b"end_header") {
            break;
        }
        if line.starts_with(b"comment") || line.starts_with(b"obj_info") {
            continue;
        }
        if line.starts_with(b"format ") {
            if line != b"format binary_little_endian 1.0" {
                return Err(EditError::ParsePly(
                    "Unsupported .ply format (only binary_little_endian 1.0 is supported)"
                        .to_string(),
                ));
            }
            continue;
        }
        if let Some(count) = line.strip_prefix(b"element vertex ") {
            let s = std::str::from_utf8(count)
                .map_err(|e| EditError::ParsePly(format!("UTF-8 error: {}", e)))?
                .trim();
            num_points = Some(
                s.parse()
                    .map_err(|e| EditError::ParsePly(format!("Parse error: {}", e)))?,
            );
            continue;
        }
        if line.starts_with(b"element ") {
            return Err(EditError::ParsePly(
                "Only a single 'vertex' element is supported".to_string(),
            ));
        }
        match line.strip_prefix(b"property float ") {
            Some(name) => field_names.push(name),
            None => {
                return Err(EditError::ParsePly(format!(
                    "Unsupported property line: {}",
                    String::from_utf8_lossy(line)
                )))
            }
        }
    }

    let num_points = num_points
        .ok_or_else(|| EditError::ParsePly("Missing 'element vertex' definition".to_string()))?;

    let mut field_map: HashMap<&str, usize> = HashMap::with_capacity(field_names.len());
    for (i, &f_bytes) in field_names.iter().enumerate() {
        let s = std::str::from_utf8(f_bytes)
            .map_err(|e| EditError::ParsePly(format!("UTF-8 error in field name: {}", e)))?;
        field_map.insert(s, i);
    }

    if num_points == 0 {
        return Ok(GaussianPointSet::default());
    }

    let ipos = [
        idx_of(&field_map, "x")?,
        idx_of(&field_map, "y")?,
        idx_of(&field_map, "z")?,
    ];
    let idc = [
        idx_of(&field_map, "f_dc_0")?,
        idx_of(&field_map, "f_dc_1")?,
        idx_of(&field_map, "f_dc_2")?,
    ];
    let iscale = [
        idx_of(&field_map, "scale_0")?,
        idx_of(&field_map, "scale_1")?,
        idx_of(&field_map, "scale_2")?,
    ];
    let irot = [
        idx_of(&field_map, "rot_0")?,
        idx_of(&field_map, "rot_1")?,
        idx_of(&field_map, "rot_2")?,
        idx_of(&field_map, "rot_3")?,
    ];
    let iop = idx_of(&field_map, "opacity")?;

    let mut rest_idx = Vec::new();
    for i in 0..MAX_SH_REST_FIELDS {
        match field_map.get(format!("f_rest_{}", i).as_str()) {
            Some(&found) => rest_idx.push(found),
            None => break,
        }
    }
    if rest_idx.len() % 3 != 0 {
        return Err(EditError::ParsePly(
            "Incomplete spherical harmonics fields".to_string(),
        ));
    }
    let k = rest_idx.len() / 3;
    let sh_degree = degree_for_dim(k);
    if dim_for_degree(sh_degree) != k {
        return Err(EditError::ParsePly(format!(
            "{} SH coefficients per channel do not match any degree",
            k
        )));
    }

    let stride = field_names.len() * 4;
    let expected_bytes = num_points
        .checked_mul(stride)
        .ok_or_else(|| EditError::ParsePly("Overflow in byte calculation".to_string()))?;
    if raw_data.len() < offset + expected_bytes {
        return Err(EditError::ParsePly(format!(
            "Binary data is too short, need {} bytes, have {}",
            expected_bytes,
            raw_data.len() - offset
        )));
    }

    let mut set = GaussianPointSet {
        sh_degree,
        positions: Vec::with_capacity(num_points * 3),
        sh_dc: Vec::with_capacity(num_points * 3),
        sh_rest: Vec::with_capacity(num_points * k * 3),
        scales: Vec::with_capacity(num_points * 3),
        rotations: Vec::with_capacity(num_points * 4),
        opacities: Vec::with_capacity(num_points),
        ..Default::default()
    };

    let data = &raw_data[offset..offset + expected_bytes];
    for vertex in data.chunks_exact(stride) {
        set.positions.extend(ipos.iter().map(|&f| read_f32(vertex, f)));
        set.sh_dc.extend(idc.iter().map(|&f| read_f32(vertex, f)));
        // Files store the rest coefficients channel-major.
        for j in 0..k {
            for channel in 0..3 {
                set.sh_rest.push(read_f32(vertex, rest_idx[channel * k + j]));
            }
        }
        set.opacities.push(read_f32(vertex, iop));
        set.scales.extend(iscale.iter().map(|&f| read_f32(vertex, f)));
        set.rotations.extend(irot.iter().map(|&f| read_f32(vertex, f)));
    }

    Ok(set)
}

/// Writes the point set as a 3DGS PLY, including zeroed normals.
pub fn write_gaussian_ply(output: &mut Vec<u8>, set: &GaussianPointSet) -> EditResult<()> {
    set.validate()?;
    let num_points = set.len();
    let k = set.sh_rest_dim();

    output.clear();
    output.extend_from_slice(b"ply\nformat binary_little_endian 1.0\n");
    writeln!(output, "element vertex {}", num_points)?;
    output.extend_from_slice(b"property float x\nproperty float y\nproperty float z\n");
    output.extend_from_slice(b"property float nx\nproperty float ny\nproperty float nz\n");
    output.extend_from_slice(
        b"property float f_dc_0\nproperty float f_dc_1\nproperty float f_dc_2\n",
    );
    for i in 0..(k * 3) {
        writeln!(output, "property float f_rest_{}", i)?;
    }
    output.extend_from_slice(
        b"property float opacity\n\
          property float scale_0\nproperty float scale_1\nproperty float scale_2\n\
          property float rot_0\nproperty float rot_1\nproperty float rot_2\nproperty float rot_3\n\
          end_header\n",
    );

    let point_size = (3 + 3 + 3 + k * 3 + 1 + 3 + 4) * 4;
    output.reserve(num_points * point_size);

    let normals = [0.0f32; 3];
    let mut rest = Vec::with_capacity(k * 3);
    for i in 0..num_points {
        output.extend_from_slice(set.positions[i * 3..i * 3 + 3].as_bytes());
        output.extend_from_slice(normals.as_bytes());
        output.extend_from_slice(set.sh_dc[i * 3..i * 3 + 3].as_bytes());

        rest.clear();
        for channel in 0..3 {
            for j in 0..k {
                rest.push(set.sh_rest[(i * k + j) * 3 + channel]);
            }
        }
        output.extend_from_slice(rest.as_bytes());

        output.extend_from_slice(set.opacities[i].as_bytes());
        output.extend_from_slice(set.scales[i * 3..i * 3 + 3].as_bytes());
        output.extend_from_slice(set.rotations[i * 4..i * 4 + 4].as_bytes());
    }
    Ok(())
}

/// Writes the scene's point cloud with normals and 8-bit colors.
pub fn write_scene_points_ply(output: &mut Vec<u8>, scene: &SceneSnapshot) -> EditResult<()> {
    output.clear();
    output.extend_from_slice(b"ply\nformat binary_little_endian 1.0\n");
    writeln!(output, "element vertex {}", scene.points.len())?;
    output.extend_from_slice(
        b"property float x\nproperty float y\nproperty float z\n\
          property float nx\nproperty float ny\nproperty float nz\n\
          property uchar red\nproperty uchar green\nproperty uchar blue\n\
          end_header\n",
    );
    output.reserve(scene.points.len() * 27);
    for (i, (p, c)) in scene.points.iter().zip(&scene.colors).enumerate() {
        let normal = scene
            .normals
            .as_ref()
            .map(|n| n[i])
            .unwrap_or([0.0; 3]);
        output.extend_from_slice(p.as_bytes());
        output.extend_from_slice(normal.as_bytes());
        output.extend(c.iter().map(|&channel| clamp_u8(channel * 255.0)));
    }
    Ok(())
}
