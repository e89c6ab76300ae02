//! Newton step limiting for exponential junctions and FET gate/drain voltages.
//!
//! Each limiter returns the voltage to linearize around and whether it differs from
//! the proposed one; a limited iteration is never reported as converged.

/// Limit a pn-junction voltage update from `vold` to `vnew`.
///
/// `vt` is `n·kT/q`, `vcrit` the voltage where the junction current curvature
/// becomes dangerous.
pub fn pnjlim(vnew: f64, vold: f64, vt: f64, vcrit: f64) -> (f64, bool) {
    if vnew > vcrit && (vnew - vold).abs() > 2.0 * vt {
        if vold > 0.0 {
            let arg = 1.0 + (vnew - vold) / vt;
            if arg > 0.0 {
                (vold + vt * arg.ln(), true)
            } else {
                (vcrit, true)
            }
        } else {
            (vt * (vnew / vt).ln(), true)
        }
    } else {
        (vnew, false)
    }
}

/// Critical voltage of a junction with saturation current `is`.
pub fn vcrit(vt: f64, is: f64) -> f64 {
    vt * (vt / (std::f64::consts::SQRT_2 * is)).ln()
}

/// Limit a gate-source voltage update around the threshold `vto`.
pub fn fetlim(vnew: f64, vold: f64, vto: f64) -> f64 {
    let vtsthi = (2.0 * (vold - vto)).abs() + 2.0;
    let vtstlo = vtsthi / 2.0 + 2.0;
    let vtox = vto + 3.5;
    let delv = vnew - vold;

    if vold >= vto {
        if vold >= vtox {
            if delv <= 0.0 {
                // going off
                if vnew >= vtox {
                    if -delv > vtstlo {
                        vold - vtstlo
                    } else {
                        vnew
                    }
                } else {
                    vnew.max(vto + 2.0)
                }
            } else if delv >= vtsthi {
                // staying on
                vold + vtsthi
            } else {
                vnew
            }
        } else if delv <= 0.0 {
            // middle region, going off
            vnew.max(vto - 0.5)
        } else {
            vnew.min(vto + 4.0)
        }
    } else if delv <= 0.0 {
        // off
        if -delv > vtsthi {
            vold - vtsthi
        } else {
            vnew
        }
    } else {
        let vtemp = vto + 0.5;
        if vnew <= vtemp {
            if delv > vtstlo {
                vold + vtstlo
            } else {
                vnew
            }
        } else {
            vtemp
        }
    }
}

/// Limit a drain-source voltage update.
pub fn limvds(vnew: f64, vold: f64) -> f64 {
    if vold >= 3.5 {
        if vnew > vold {
            vnew.min(3.0 * vold + 2.0)
        } else if vnew < 3.5 {
            vnew.max(2.0)
        } else {
            vnew
        }
    } else if vnew > vold {
        vnew.min(4.0)
    } else {
        vnew.max(-0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const VT: f64 = 0.025865;

    #[test]
    fn small_steps_pass_through() {
        assert_eq!(pnjlim(0.61, 0.6, VT, 0.6), (0.61, false));
        assert_eq!(pnjlim(-5.0, 0.0, VT, 0.6), (-5.0, false));
    }

    #[test]
    fn large_forward_step_is_compressed() {
        let vc = vcrit(VT, 1e-14);
        let (v, limited) = pnjlim(5.0, 0.7, VT, vc);
        assert!(limited);
        assert!(v > 0.7 && v < 1.0, "{v}");
    }

    #[test]
    fn from_reverse_bias_jumps_to_log() {
        let (v, limited) = pnjlim(2.0, -1.0, VT, 0.6);
        assert!(limited);
        assert!((v - VT * (2.0 / VT).ln()).abs() < 1e-12);
    }

    #[rstest]
    #[case(10.0, 0.0, 4.0)]
    #[case(-3.0, 0.0, -0.5)]
    #[case(100.0, 5.0, 17.0)]
    #[case(0.0, 5.0, 2.0)]
    fn drain_source_limits(#[case] vnew: f64, #[case] vold: f64, #[case] expected: f64) {
        assert_eq!(limvds(vnew, vold), expected);
    }

    #[test]
    fn fet_turning_on_stops_above_threshold() {
        // off, big positive step: clamp to vto + 0.5
        assert_eq!(fetlim(10.0, 0.0, 1.0), 1.5);
        // on and well above, small step passes
        assert_eq!(fetlim(5.1, 5.0, 1.0), 5.1);
    }
}
